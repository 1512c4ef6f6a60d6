//! Paginated listing and recursive block retrieval on top of the controller.
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::cache::{CacheKey, CacheStats, TtlCache};
use crate::controller::{ConcurrencyController, Request};
use crate::error::RemoteError;
use crate::notion::model::{BlockNode, ListPage, RemoteRecord};
use crate::notion::{NotionClient, MAX_PAGE_SIZE};

const LIST_RECORDS: &str = "list_records";
const BLOCK_TREE: &str = "block_tree";

pub const DEFAULT_MAX_DEPTH: usize = 3;

/// Values held by the fetch cache. Shared, never mutated.
#[derive(Debug, Clone)]
pub enum Cached {
    Records(Arc<Vec<RemoteRecord>>),
    Blocks(Arc<Vec<BlockNode>>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordFilter {
    /// Records whose `last_edited_time` is strictly after the timestamp.
    EditedAfter(DateTime<Utc>),
    /// A filter object passed to the API untouched.
    Raw(Value),
}

impl RecordFilter {
    pub fn to_json(&self) -> Value {
        match self {
            RecordFilter::EditedAfter(ts) => json!({
                "timestamp": "last_edited_time",
                "last_edited_time": { "after": ts.to_rfc3339_opts(SecondsFormat::Millis, true) }
            }),
            RecordFilter::Raw(filter) => filter.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    pub page_size: usize,
    pub max_depth: usize,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: MAX_PAGE_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

/// Blocks of one page plus the branches that could not be fetched.
#[derive(Debug, Clone, Default)]
pub struct BlockTree {
    pub blocks: Vec<BlockNode>,
    /// `(parent block id, error)` for each branch left empty after a failure.
    pub failures: Vec<(String, RemoteError)>,
}

impl BlockTree {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a BlockNode)) {
        for block in &self.blocks {
            block.walk(visit);
        }
    }
}

pub struct FetchClient {
    api: NotionClient,
    controller: Arc<ConcurrencyController>,
    cache: Arc<TtlCache<Cached>>,
    options: FetchOptions,
}

impl FetchClient {
    pub fn new(
        api: NotionClient,
        controller: Arc<ConcurrencyController>,
        cache: Arc<TtlCache<Cached>>,
        options: FetchOptions,
    ) -> Self {
        Self {
            api,
            controller,
            cache,
            options,
        }
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    pub fn controller(&self) -> &Arc<ConcurrencyController> {
        &self.controller
    }

    fn page_size(&self) -> usize {
        self.options.page_size.clamp(1, MAX_PAGE_SIZE)
    }

    /// Every non-archived record of `database_id`, in server order.
    #[instrument(skip_all, fields(database_id = %database_id))]
    pub async fn list_records(
        &self,
        database_id: &str,
        filter: Option<&RecordFilter>,
    ) -> Result<Vec<RemoteRecord>, RemoteError> {
        let filter = filter.map(RecordFilter::to_json);
        let key = CacheKey::new(
            LIST_RECORDS,
            database_id,
            filter.as_ref().map(Value::to_string),
        );
        if let Some(Cached::Records(records)) = self.cache.get(&key) {
            debug!(count = records.len(), "listing served from cache");
            return Ok(records.as_ref().clone());
        }

        let mut records = Vec::new();
        let mut seen_cursors = HashSet::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let request = self
                .api
                .query_database_request(
                    database_id,
                    self.page_size(),
                    cursor.as_deref(),
                    filter.as_ref(),
                )
                .map_err(internal)?;
            let page: ListPage<RemoteRecord> = self.controller.execute(request).await?.json()?;
            pages += 1;
            records.extend(page.results.into_iter().filter(|r| !r.archived));
            if !page.has_more {
                break;
            }
            // A partial listing must never pass for a complete one.
            let Some(next) = page.next_cursor else {
                return Err(RemoteError::Payload(format!(
                    "has_more without next_cursor while listing {}",
                    database_id
                )));
            };
            if !seen_cursors.insert(next.clone()) {
                return Err(RemoteError::Payload(format!(
                    "cursor {} returned twice while listing {}",
                    next, database_id
                )));
            }
            cursor = Some(next);
        }
        debug!(pages, count = records.len(), "listed records");

        self.cache
            .put(key, Cached::Records(Arc::new(records.clone())));
        Ok(records)
    }

    /// Block tree of `root_id`, fetched level by level down to `max_depth`.
    ///
    /// The root is depth 0 and a node at depth `d` has its children fetched
    /// only when `d < max_depth`. A 404 ends a node's children where they
    /// stand, keeping pages already fetched. Any
    /// other failure fails the call when it hits the root and otherwise only
    /// empties that branch, recorded in [`BlockTree::failures`].
    #[instrument(skip_all, fields(root_id = %root_id, max_depth))]
    pub async fn get_block_tree(
        &self,
        root_id: &str,
        max_depth: usize,
    ) -> Result<BlockTree, RemoteError> {
        let key = CacheKey::new(BLOCK_TREE, root_id, max_depth);
        if let Some(Cached::Blocks(blocks)) = self.cache.get(&key) {
            debug!("block tree served from cache");
            return Ok(BlockTree {
                blocks: blocks.as_ref().clone(),
                failures: Vec::new(),
            });
        }

        let mut arena = Arena::default();
        let mut top_level = Vec::new();
        let mut failures = Vec::new();
        let mut visited = HashSet::from([root_id.to_string()]);

        // (arena slot of the parent, None for the root; block id to list)
        let mut level: Vec<(Option<usize>, String)> = vec![(None, root_id.to_string())];
        let mut depth = 0usize;
        while !level.is_empty() && depth < max_depth {
            let fetched = self.fetch_level(&level, &mut failures).await?;
            let mut next_level = Vec::new();
            for ((parent, _), children) in level.iter().zip(fetched) {
                for node in children {
                    if !visited.insert(node.id.clone()) {
                        debug!(block_id = %node.id, "block already visited");
                        continue;
                    }
                    let wants_children = node.wants_children();
                    let id = node.id.clone();
                    let slot = arena.push(node);
                    match parent {
                        Some(p) => arena.children[*p].push(slot),
                        None => top_level.push(slot),
                    }
                    if wants_children {
                        next_level.push((Some(slot), id));
                    }
                }
            }
            level = next_level;
            depth += 1;
        }

        let blocks: Vec<BlockNode> = top_level
            .into_iter()
            .filter_map(|slot| arena.assemble(slot))
            .collect();
        if failures.is_empty() {
            self.cache
                .put(key, Cached::Blocks(Arc::new(blocks.clone())));
        } else {
            warn!(failed_branches = failures.len(), "block tree incomplete");
        }
        Ok(BlockTree { blocks, failures })
    }

    /// Children of every block in `level`, following pagination. All first
    /// pages go to the controller together, then all follow-up pages.
    async fn fetch_level(
        &self,
        level: &[(Option<usize>, String)],
        failures: &mut Vec<(String, RemoteError)>,
    ) -> Result<Vec<Vec<BlockNode>>, RemoteError> {
        let mut fetched: Vec<Vec<BlockNode>> = level.iter().map(|_| Vec::new()).collect();
        let mut pending: Vec<(usize, Option<String>)> =
            (0..level.len()).map(|i| (i, None)).collect();

        while !pending.is_empty() {
            let requests = pending
                .iter()
                .map(|(i, cursor)| {
                    self.api
                        .block_children_request(&level[*i].1, self.page_size(), cursor.as_deref())
                        .map_err(internal)
                })
                .collect::<Result<Vec<Request>, RemoteError>>()?;
            let results = self.controller.submit(requests).await;

            let mut follow_ups = Vec::new();
            for ((i, _), result) in pending.into_iter().zip(results) {
                let (parent, block_id) = &level[i];
                let page = result.and_then(|res| {
                    let page: ListPage<Value> = res.json()?;
                    let nodes = page
                        .results
                        .iter()
                        .map(BlockNode::from_value)
                        .collect::<Result<Vec<_>, _>>()?;
                    match (page.has_more, page.next_cursor) {
                        (false, _) => Ok((nodes, None)),
                        (true, Some(next)) => Ok((nodes, Some(next))),
                        (true, None) => Err(RemoteError::Payload(format!(
                            "has_more without next_cursor under {}",
                            block_id
                        ))),
                    }
                });
                match page {
                    Ok((nodes, next)) => {
                        fetched[i].extend(nodes);
                        if let Some(next) = next {
                            follow_ups.push((i, Some(next)));
                        }
                    }
                    Err(err) if err.is_not_found() => {
                        // Keeps children already collected from earlier pages.
                        debug!(
                            block_id = %block_id,
                            kept = fetched[i].len(),
                            "children not found; stopping pagination"
                        );
                    }
                    Err(err) if parent.is_none() => return Err(err),
                    Err(err) => {
                        warn!(block_id = %block_id, error = %err, "failed to fetch branch");
                        fetched[i].clear();
                        failures.push((block_id.clone(), err));
                    }
                }
            }
            pending = follow_ups;
        }
        Ok(fetched)
    }

    /// Drop every cached listing or tree of `object_id`.
    pub fn invalidate(&self, object_id: &str) -> usize {
        self.cache.invalidate_scope(object_id)
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

#[derive(Default)]
struct Arena {
    nodes: Vec<Option<BlockNode>>,
    children: Vec<Vec<usize>>,
}

impl Arena {
    fn push(&mut self, node: BlockNode) -> usize {
        self.nodes.push(Some(node));
        self.children.push(Vec::new());
        self.nodes.len() - 1
    }

    fn assemble(&mut self, slot: usize) -> Option<BlockNode> {
        let mut node = self.nodes.get_mut(slot)?.take()?;
        let child_slots = std::mem::take(&mut self.children[slot]);
        let children = child_slots
            .into_iter()
            .filter_map(|c| self.assemble(c))
            .collect();
        node.set_children(children);
        Some(node)
    }
}

fn internal(err: anyhow::Error) -> RemoteError {
    RemoteError::Internal(format!("{:#}", err))
}

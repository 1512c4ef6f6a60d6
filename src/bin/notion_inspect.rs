use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use notion_sync::config;
use notion_sync::db;
use notion_sync::engine::Engine;
use notion_sync::notion::model::BlockNode;
use notion_sync::notion::normalize_id;

#[derive(Parser, Debug)]
struct Args {
    /// Path to YAML config
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Database ID or URL to inspect
    #[arg(long)]
    db_id: String,

    /// Also dump the block tree of this page
    #[arg(long)]
    tree: Option<String>,

    #[arg(long, default_value_t = 3)]
    depth: usize,
}

fn print_block(block: &BlockNode, indent: usize) {
    let text = block.plain_text();
    println!(
        "{}- {} {}{}",
        "  ".repeat(indent),
        block.kind.as_str(),
        block.id,
        if text.is_empty() {
            String::new()
        } else {
            format!(" \"{}\"", text)
        }
    );
    for child in &block.children {
        print_block(child, indent + 1);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    let db_id = normalize_id(&args.db_id).ok_or_else(|| anyhow!("not a Notion id: {}", args.db_id))?;

    // Inspection never touches the configured store.
    let pool = db::init_pool("sqlite::memory:").await?;
    db::run_migrations(&pool).await?;
    let engine = Engine::from_config(&cfg, pool)?;

    let schema = engine.api.retrieve_database(&db_id).await?;
    println!("Database ID: {}", schema.id);
    println!("Properties:");
    for (name, prop) in schema.properties {
        println!("  {} -> {{ id: {}, type: {} }}", name, prop.id, prop.typ);
    }

    let records = engine.fetch.list_records(&db_id, None).await?;
    println!("Records ({}):", records.len());
    for record in &records {
        println!(
            "  {} {} {}",
            record.id,
            record.last_edited_time.to_rfc3339(),
            record.title().unwrap_or_default()
        );
    }

    if let Some(page) = args.tree {
        let page_id = normalize_id(&page).ok_or_else(|| anyhow!("not a Notion id: {}", page))?;
        let tree = engine.fetch.get_block_tree(&page_id, args.depth).await?;
        println!("Blocks of {}:", page_id);
        for block in &tree.blocks {
            print_block(block, 1);
        }
        for (block_id, err) in &tree.failures {
            println!("  ! {}: {}", block_id, err);
        }
    }
    Ok(())
}

pub mod assets;
pub mod cache;
pub mod config;
pub mod controller;
pub mod db;
pub mod engine;
pub mod error;
pub mod fetch;
pub mod model;
pub mod notion;
pub mod render;
pub mod store;
pub mod sync;

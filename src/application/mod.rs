//! Application layer: the node that owns the apply path.

mod lending_node;

pub use lending_node::{load_seed_file, Ingest, LendingNode, NodeStats, SeedItem};

// Forbid unwrap() in production code to prevent panics from corrupt data.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]

use ordered_index::config::resolve_path;
use ordered_index::store::FileStore;
use ordered_index::{BTree, IndexConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ordered_index=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = match resolve_path(std::env::args().nth(1), |name| std::env::var(name).ok()) {
        Ok(path) => path,
        Err(e) => {
            tracing::error!("Usage: ordered-index <path> ({e})");
            std::process::exit(1);
        }
    };

    let config = match IndexConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let store = match FileStore::open(&path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!("Failed to open {}: {e}", path.display());
            std::process::exit(1);
        }
    };
    tracing::info!(
        "Opened {}: {} blocks, {} free",
        path.display(),
        store.block_count(),
        store.free_count()
    );

    let mut tree = match BTree::open_existing(store, config) {
        Ok(tree) => tree,
        Err(e) => {
            tracing::error!("Failed to open index: {e}");
            std::process::exit(1);
        }
    };

    match tree.check() {
        Ok(stats) => {
            tracing::info!(
                height = stats.height,
                nodes = stats.nodes,
                keys = stats.keys,
                "index is consistent"
            );
            let live = tree.store().live_blocks();
            if live != stats.nodes as u64 {
                tracing::warn!("{live} live blocks but {} reachable nodes", stats.nodes);
            }
        }
        Err(e) => {
            tracing::error!("Index check failed: {e}");
            std::process::exit(1);
        }
    }
}

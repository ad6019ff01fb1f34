mod block_cache;
mod node_cache;

pub use block_cache::{BlockCache, CacheKind};
pub use node_cache::{Node, NodeCache};

//! Layer cache
//!
//! The cache is made of:
//!
//! - [`CacheIndex`]: JSON record of every built layer node, the dependency
//!   graph between logical layers, and the chain tracked for each output tag
//! - [`TieredCache`]: where the layer images actually live (engine store,
//!   shared archive directory, registry)
//! - [`ChecksumStore`]: whole-config checksums used to skip unchanged builds
//! - [`CacheLock`]: advisory single-writer lock on the cache directory
//!
//! # Node Lifecycle
//!
//! | Status | Meaning |
//! |--------|---------|
//! | Active | Referenced (directly or as an ancestor) by a tracked chain |
//! | Stale | Unreferenced; evicted once unused past the age threshold |
//! | Evicted | Removed from the index; artifact reclaimed |

pub mod checksum;
pub mod index;
pub mod lock;
pub mod tier;

pub use checksum::ChecksumStore;
pub use index::{CacheIndex, IndexState, LayerChain, LayerNode, NodeStatus};
pub use lock::CacheLock;
pub use tier::{DirectoryTier, EngineTier, Lookup, RegistryTier, Tier, TierBackend, TieredCache};

//! shardgrid-cache — cluster-state snapshot cache for the rebalance pipeline.
//!
//! Sits at the head of the controller's rebalance pipeline and turns many
//! small metadata-store reads into one consistent in-memory snapshot per
//! pipeline iteration. Watchers mark change categories dirty between
//! refreshes; a refresh reloads exactly the dirty categories and rebuilds
//! the derived indices.
//!
//! # Architecture
//!
//! ```text
//! ClusterCache
//!   ├── DirtyFlags (atomic per-category bits, shared with ChangeNotifier)
//!   ├── Shadow maps (staging) → live Arc snapshots (readers never lock)
//!   ├── CurrentStateCache (stat-compared incremental reload)
//!   ├── InstanceMessagesCache (pending messages + relay refinement)
//!   ├── TaskDataCache (job/workflow configs and contexts)
//!   └── Derived indices (disabled sets, offline times) + memo caches
//! ```
//!
//! # Refresh ordering
//!
//! Category reloads happen before the live-map snapshot; sub-caches consume
//! the snapshot; the current-state sub-cache refreshes strictly before
//! relay-message refinement; derived indices are computed last. A transport
//! failure aborts the refresh and leaves the previous snapshot in place.

pub mod cluster;
pub mod current_state;
pub mod dirty;
pub mod error;
pub mod messages;
pub mod task_data;

pub use cluster::ClusterCache;
pub use current_state::{CurrentStateCache, CurrentStateView};
pub use dirty::{ChangeCategory, ChangeNotifier};
pub use error::{CacheError, CacheResult};
pub use messages::{InstanceMessagesCache, RelayFilter, default_relay_filter};
pub use task_data::TaskDataCache;

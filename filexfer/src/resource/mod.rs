//! Shared byte budget: per-loader state and the scheduler granting it.
//!
//! - [`ResourceState`]: one loader's claim (limit / used / using / estimate)
//! - [`ResourceManager`]: grant policy over all registered loaders
//! - [`ResourceManagerHandle`]: the manager running as a task
//! - [`ResourceLease`]: a loader's registration, unregistered on drop

mod manager;
mod state;

pub use manager::{
    NodeId, ResourceLease, ResourceManager, ResourceManagerHandle, ResourceMode, ResourceWorker,
};
pub use state::ResourceState;

//! Queue snapshot capture and retention for a music player.
//!
//! [`engine::Engine`] is the entry point for hosts. The coordinators it
//! drives (`auto`, `sync`, `capacity`) can also be used on their own.

pub mod auto;
pub mod capacity;
pub mod engine;
pub mod error;
pub mod events;
pub mod notify;
pub mod queue;
pub mod restore;
pub mod settings;
pub mod snapshot;
pub mod storage;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use engine::{Engine, EngineParts};
pub use error::{EngineError, EngineResult};
pub use settings::{AutoMode, Settings, SettingsHandle};
pub use snapshot::{Snapshot, SnapshotType};

//! Persisted run state.
//!
//! Run manifests are written after every scheduler mutation so status
//! queries survive a process restart.

mod manifest;

pub use manifest::{ManifestStore, RunManifest};

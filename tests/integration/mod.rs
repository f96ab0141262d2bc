//! Integration test suite for dagrun.
//!
//! These tests drive the orchestrator end to end with real local
//! processes, temporary workspaces and a mock remote endpoint.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Submission, layered execution and failure blocking
//! - `parallel_layers`: Concurrency bounds and isolation under parallel load
//! - `conflict_resolution`: Output conflicts, policies and validation
//! - `persistence`: Status answered from stored manifests after a restart
//! - `remote_backend`: Offloading to a remote endpoint and fallback
//! - `dag_properties`: Property tests for layering
//!
//! # CI Compatibility
//!
//! Tasks are plain shell commands and the remote endpoint is a local
//! mock server, so no network access is needed.


mod workflow_e2e;
mod parallel_layers;
mod conflict_resolution;
mod persistence;
mod remote_backend;
mod dag_properties;

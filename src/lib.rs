//! Keygate - Distributed API Key Verification
//!
//! This crate verifies API keys at the edge: key validity, fixed-window rate
//! limits with per-identifier overrides, and atomic usage budgets with
//! periodic refills. Regions share authoritative counters through a window
//! store and keep their metadata caches coherent over a gossip mesh.

pub mod cache;
pub mod clock;
pub mod config;
pub mod edge;
pub mod error;
pub mod grpc;
pub mod keys;
pub mod mesh;
pub mod ratelimit;
pub mod seed;
pub mod store;

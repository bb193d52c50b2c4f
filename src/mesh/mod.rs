//! Peer mesh networking module using Chitchat.
//!
//! Edge coordinators in different regions join one gossip cluster so that a
//! metadata write in one region invalidates the caches of all others.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, EpochTracker, InvalidationKind};

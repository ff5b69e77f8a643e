// Peerdoc - Peer-to-peer replicated documents

pub mod config;
pub mod convergent;
pub mod identity;
pub mod network;
pub mod replica;
pub mod sync;
pub mod todo;

pub use config::{ConfigError, ReplicaConfig};
pub use replica::{Replica, ReplicaError, ReplicaHandle, ReplicaStatus};

//! Mirrorio Core - synchronous quorum replication over blob storage backends
//!
//! A replica store fans every write out to N content-addressed backends
//! and acknowledges once a configurable quorum confirms receipt with the
//! exact byte count read from the source:
//! - reads try backends in configured order, first success wins
//! - stats fan out to all backends and report each reference once
//! - removals are best-effort (any backend success counts)
//! - enumeration is a merged, deduplicated view over all backends
//!
//! This is a dumb, best-effort mirror, not a consensus system: no
//! conflict resolution, no anti-entropy repair, no re-replication.

pub mod backend;
pub mod backends;
pub mod blobref;
pub mod context;
pub mod error;
pub mod hub;
pub mod merge;
pub mod registry;
pub mod replica;

pub use backend::{BlobRead, Storage};
pub use backends::{LocalDiskStorage, MemoryStorage};
pub use blobref::{BlobRef, SizedBlobRef};
pub use context::OpContext;
pub use error::{MirrorError, Result};
pub use hub::{BlobHub, BlobHubPartitionMap};
pub use merge::merged_enumerate;
pub use registry::{Loader, StorageDefinition, StorageRegistry, build_registry, build_storage};
pub use replica::{ReplicaConfig, ReplicaStore};

//! Tern storage node
//!
//! The node side of the mesh. A [`StorageNode`] keeps a local index of
//! [`ReplicaRecord`](tern_proto::ReplicaRecord)s next to a [`BlobStore`]
//! holding the raw bytes, and answers the master's requests.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │                StorageNode                   │
//! ├──────────────────────────────────────────────┤
//! │  LocalChannel ──▶ handle(NodeRequest)        │
//! │                      │                       │
//! │        ┌─────────────┴─────────────┐         │
//! │  ┌─────▼──────┐            ┌───────▼──────┐  │
//! │  │ file index │            │  BlobStore   │  │
//! │  │ index.json │            │ memory | fs  │  │
//! │  └────────────┘            └──────────────┘  │
//! │                                              │
//! │  NodeDaemon: heartbeats + integrity sweep    │
//! └──────────────────────────────────────────────┘
//! ```

pub mod blob;
pub mod channel;
pub mod daemon;
pub mod error;
pub mod node;

pub use blob::{BlobStore, FsBlobStore, MemoryBlobStore};
pub use channel::LocalChannel;
pub use daemon::{NodeDaemon, NodeDaemonConfig};
pub use error::{Error, Result};
pub use node::{IntegrityReport, NodeOptions, StorageNode};

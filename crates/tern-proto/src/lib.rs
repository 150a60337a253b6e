//! Tern wire protocol and data model
//!
//! Types shared between the master and storage nodes:
//! - `ReplicaRecord`: one node's record of one file
//! - CRC-32 checksums over file content and metadata
//! - `NodeRequest` / `NodeResponse`: the per-node RPC contract
//! - `NodeChannel`: a request/response channel to a single node
//!
//! ## Message flow
//!
//! ```text
//!   storage node                         master
//!  ┌────────────┐   HEARTBEAT {id,n}   ┌────────────┐
//!  │            │ ───────────────────▶ │            │
//!  │   index    │   QUERY_INDEX/FILE   │  registry  │
//!  │   blobs    │ ◀─────────────────── │  engine    │
//!  │            │   ADD/UPDATE/DELETE  │            │
//!  └────────────┘ ◀─────────────────── └────────────┘
//! ```

pub mod channel;
pub mod codec;
pub mod message;
pub mod record;

pub use channel::{call_with_timeout, NodeChannel, RpcError, SharedChannel};
pub use message::{AddFile, DeleteFile, Heartbeat, NodeRequest, NodeResponse, UpdateFile};
pub use record::{
    content_checksum, meta_checksum, FileId, FileIndex, FileMeta, FileStatus, NodeId,
    ReplicaRecord,
};

//! Self-healing replication for the tern file mesh
//!
//! The master side of the mesh:
//! - Tracks storage node liveness from heartbeats
//! - Aggregates every node's file index into one global view
//! - Detects under/over-replication and replica drift
//! - Repairs files by adding, removing or fixing single replicas
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Coordinator                        │
//! │  heartbeats ─▶ failure loop (2.5s) refresh (10s)         │
//! │                validate (10s)     add/delete/list API    │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐        ┌─────────────────────────────┐ │
//! │  │ NodeRegistry │◀───────│      ReplicationEngine      │ │
//! │  │  liveness    │        │  snapshots ─▶ Mesh (Arc)    │ │
//! │  │  placement   │        │  validate ─▶ quorum ─▶ fix  │ │
//! │  │  dispatch    │        │            add / remove     │ │
//! │  └──────┬───────┘        └──────────────┬──────────────┘ │
//! │         │          RepairLocks          │                │
//! └─────────┼───────────────────────────────┼────────────────┘
//!           ▼                               ▼
//!      NodeChannel (per node, request/response with deadline)
//! ```

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod locks;
pub mod mesh;
pub mod metrics;
pub mod quorum;
pub mod registry;

mod rpc;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MeshConfig;
pub use coordinator::{Coordinator, CoordinatorState};
pub use engine::{
    FileListing, RefreshReport, RepairOutcome, ReplicationEngine, ValidationReport,
};
pub use error::{Error, Result};
pub use locks::{RepairGuard, RepairLocks};
pub use mesh::{Mesh, MeshEntry};
pub use metrics::{RepairMetrics, RepairStats};
pub use quorum::{FixPlan, MismatchKind};
pub use registry::{HeartbeatOutcome, NodeInfo, NodeRegistry};

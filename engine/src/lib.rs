//! # Shelf Engine - Managed NAS Storage Core
//!
//! A headless storage core that presents a managed, content-addressed view
//! over a real filesystem. Designed as the foundation for multiple front ends
//! (CLI, HTTP service, automation).
//!
//! ## Overview
//!
//! The engine provides:
//! - Persistent identities for files and directories that survive renames
//!   and remounts, kept in extended attributes or a sidecar index
//! - An in-memory forest per drive, kept in sync by background scans
//! - Segment-parallel content fingerprints for arbitrarily large files
//! - A registry mapping content to the files that hold it
//! - Copy/move tasks that stop at name collisions and resume once a
//!   policy is chosen, per entry or for a whole class of collisions
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use shelf_engine::{EngineConfig, FailureRule, Mode, TaskPolicies, Vfs, BatchEntry};
//! use std::path::Path;
//! use uuid::Uuid;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut vfs = Vfs::open(EngineConfig::load(Path::new("/etc/shelf.toml"))?)?;
//! let drive = Uuid::parse_str("7d444840-9dc0-11d1-b245-5ffdce74fad2")?;
//! vfs.create_root(drive)?;
//!
//! let tree = vfs.get_tree(drive)?;
//! let photos = tree.child("photos").ok_or("no photos")?.uuid;
//! let inbox = tree.child("inbox").ok_or("no inbox")?.uuid;
//!
//! let entries = vec![BatchEntry { drive, dir: photos, name: "holiday.jpg".into() }];
//! for node in vfs.preview_conflicts(&entries, drive, inbox)? {
//!     println!("{}: {:?}", node.name, node.policies());
//! }
//!
//! let batch = vfs.create_batch_copy(
//!     Mode::Copy,
//!     &entries,
//!     drive,
//!     inbox,
//!     TaskPolicies::default(),
//!     FailureRule::Stop,
//! )?;
//! println!("{:?}", vfs.run_batch(batch, None)?);
//!
//! vfs.index_pending()?;
//! vfs.shutdown()?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Shared data types (fingerprints, tree snapshots, states, policies)
//! - **error**: Error types with stable codes
//! - **config**: TOML configuration
//! - **xstat**: Identity store over xattrs or a sidecar index
//! - **forest**: Per-drive node arena and scan state machine
//! - **fingerprint**: Segment-parallel content fingerprints
//! - **registry**: Content registry with an append-only snapshot
//! - **xtree**: Conflict policies and their post-images
//! - **task** / **sink**: Copy/move tasks and batches of them
//! - **vfs**: Facade owning all of the above
//! - **progress**: Progress callback trait

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod forest;
pub mod fs_ops;
pub mod magic;
pub mod model;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod sink;
pub mod task;
pub mod vfs;
pub mod xstat;
pub mod xtree;

// Re-export main types and functions
pub use config::{EngineConfig, IdentityBackend};
pub use error::{ApiError, EngineError, EngineResult};
pub use fingerprint::Fingerprinter;
pub use forest::{Forest, NodeId};
pub use magic::ContentType;
pub use model::{
    Conflict, ConflictReason, EntryKind, Fingerprint, Mode, NodeState, Outcome, Policy, TaskState, TreeEntry,
};
pub use progress::ProgressCallback;
pub use registry::{DigestRegistry, HeaderExtractor, MetadataExtractor, RegistryEntry};
pub use sink::{BatchEntry, FailureRule, Sink, SinkState, SinkSummary};
pub use task::{AbortHandle, Task, TaskNode, TaskPolicies, TaskSummary};
pub use vfs::{IndexReport, Vfs};
pub use xstat::{IdentityStore, Xstat};
pub use xtree::{expand, expand_all, PolicyNode};

//! Persistence synchronization layer for the TeamTrack project tracker.
//!
//! One authoritative in-memory snapshot is reconciled against up to two
//! independent, permission-gated external stores: a user-picked local
//! file and a cloud-hosted canonical file. The [`SyncCoordinator`] drives
//! the cycle; genuine divergence pauses for an explicit user decision
//! through the [`ConflictGate`] rather than merging or overwriting.
//!
//! The UI surface (pickers, consent popup, conflict modal) stays outside
//! this crate behind the [`AccessBroker`], [`FolderPicker`],
//! [`ConsentFlow`] and [`ConflictGate`] traits.

pub mod config;
pub mod coordinator;
pub mod drive;
pub mod error;
pub mod local_file;
pub mod logging;
pub mod session;
pub mod snapshot;

pub use config::SyncConfig;
pub use coordinator::{
    ConflictGate, FetchOutcome, ResolveChoice, SnapshotStore, SyncCoordinator, SyncState,
};
pub use drive::{FolderPicker, FolderRef, RemoteStoreClient};
pub use error::{Result, SyncError};
pub use local_file::{
    AccessBroker, FileHandle, FsAccessBroker, LocalFileClient, PermissionMode, PermissionState,
};
pub use session::{
    CloudSessionManager, ConsentFlow, SessionState, SessionToken, TokenGrant, UserProfile,
};
pub use snapshot::{Snapshot, SyncSource};

//! Workspace filesystem gateway
//!
//! Every container's `/workspace` is a host-side directory bind-mounted
//! into the sandbox. The gateway serves reads, writes, listings and tar
//! transfers against that directory, with path containment enforced
//! before any filesystem call.

mod archive;
mod errors;
mod gateway;
mod path;

pub use archive::ImportSummary;
pub use errors::{WorkspaceError, WorkspaceResult};
pub use gateway::{EntryInfo, ReadFile, WorkspaceGateway, WriteOp, WriteOutcome};
pub use path::WorkspacePath;

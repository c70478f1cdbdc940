//! Semistatic - branchless runtime dispatch by patching a trampoline's jump
//!
//! A dispatcher owns the entry point of one function signature and rewrites
//! the relative jump at its start whenever the selected target changes.
//! Calls through the entry point never evaluate a condition.

pub mod config;
pub mod dispatch;
pub mod error;

// Re-export commonly used types
pub use config::{FlushMode, PatchConfig, PermissionMode};
pub use dispatch::{BranchChanger, Entry, HostInfo, Method, Signature, Switch};
pub use error::{BranchError, BranchResult, ErrorKind};

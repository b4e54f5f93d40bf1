//! Shared plumbing for the vouch workload identity broker.
//!
//! This crate carries the pieces both servers (and the token providers) lean
//! on:
//!
//! - [`error`] - status-carrying errors that deep layers can raise and the
//!   HTTP boundary renders verbatim
//! - [`undo`] - compensating-action stack for rolling back partially applied
//!   file operations
//! - [`kvlist`] - insertion-ordered key/value list driving multi-file rotation
//! - [`files`] - atomic symlink rotation with rollback
//! - [`http`] - TLS-aware JSON client helpers with bounded retry, plus the
//!   request-duration cap middleware
//! - [`gcp`] - Google Cloud scope/audience helpers and the STS/IAM wire types
//! - [`apimetrics`] - facade for outbound-call and cache counters
//! - [`net`] - IP canonicalization and node naming

pub mod apimetrics;
pub mod cmp;
pub mod error;
pub mod files;
pub mod gcp;
pub mod http;
pub mod kvlist;
pub mod net;
pub mod undo;

pub use error::StatusError;
pub use kvlist::KvList;
pub use undo::UndoStack;

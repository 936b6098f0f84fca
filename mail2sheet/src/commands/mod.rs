//! CLI command handlers
//!
//! Commands are thin wrappers that wire configuration into the sync engine,
//! the OAuth flow, or the checkpoint store.
//!
//! - `run`: one sync run
//! - `authorize`: one-time browser sign-in
//! - `status`: read-only view of the checkpoint

pub mod authorize;
pub mod run;
pub mod status;

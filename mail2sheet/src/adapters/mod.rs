//! Provider adapters
//!
//! - `gmail`: the mailbox, as an `EventSource`
//! - `sheets`: the spreadsheet, as a `LogSink`
//! - `http`: request plumbing and status mapping shared by both

pub mod gmail;
pub mod http;
pub mod sheets;

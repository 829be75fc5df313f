//! Rollchain library exports
//!
//! Session tokens, the hash-chained attendance ledger and the verification
//! pipeline that ties them to the external trust-anchor and content-store
//! bridges.

pub mod bridge;
pub mod clock;
pub mod config;
pub mod error;
pub mod ledger;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod service;
pub mod session;
pub mod store;

pub use config::CheckinConfig;
pub use error::CheckinError;
pub use pipeline::{AttendanceOutcome, AttendancePipeline, AttendanceReceipt};
pub use service::{AttendanceStatus, CheckinService};
pub use session::{SessionManager, SessionToken};

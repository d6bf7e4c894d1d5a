//! Shared Schemas for the ingestion core
//!
//! All structs use `serde(rename_all = "camelCase")` so the rows and run
//! summaries read the same in logs as in the downstream web application.

pub mod job_run;
pub mod listing;

pub use job_run::*;
pub use listing::*;

//! Ingestion pipeline core for keel.
//!
//! A run stages an input batch, bootstraps the target table from it when the
//! table is absent, and upserts the staged rows into the table by an integer
//! key. All table access goes through a [`keel_store::TableStore`].

#![warn(clippy::pedantic)]

pub mod batch;
pub mod bootstrap;
mod blocking;
pub mod config;
pub mod errors;
pub mod merge;
pub mod orchestrator;
pub mod result;
pub mod stage;

pub use batch::{Batch, InputFormat};
pub use bootstrap::{ensure_table, TableHandle};
pub use errors::PipelineError;
pub use merge::{merge, RetryPolicy};
pub use orchestrator::{check_pipeline, open_store, run_pipeline, run_pipeline_with_store};
pub use result::{CheckReport, PipelineOutcome};
pub use stage::stage;

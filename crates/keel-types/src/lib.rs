//! Shared keel model types.
//!
//! Identifiers, table schemas, merge requests, and run history records used by
//! the store, engine, and CLI crates. Nothing here depends on Arrow.

#![warn(clippy::pedantic)]

pub mod ident;
pub mod merge;
pub mod run;
pub mod schema;

//! Domain types shared by the atelier crates.
//!
//! Holds the node-graph template model, the flat parameter record the
//! front-end edits, the binding tables that translate between the two,
//! and the job/result types owned by the progress reconciler.

pub mod binder;
pub mod error;
pub mod job;
pub mod params;
pub mod types;
pub mod variant;
pub mod workflow;

//! Job pipeline: reconciles push and pull channels into one progress
//! signal, retrieves artifacts, and exposes the single-call
//! [`coordinator::JobCoordinator`] entry point.

pub mod artifact;
pub mod config;
pub mod coordinator;
pub mod fallback;
pub mod progress;
pub mod reconciler;

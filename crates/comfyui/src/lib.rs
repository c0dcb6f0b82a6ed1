//! ComfyUI WebSocket and REST client library.
//!
//! Provides typed message parsing and normalization, WebSocket
//! connection management, HTTP API wrappers, bounded reconnection, and
//! the per-job event listener used by the job pipeline.

pub mod api;
pub mod client;
pub mod events;
pub mod listener;
pub mod messages;
pub mod reconnect;

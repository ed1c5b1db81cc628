//! SSE HTTP handler for the web layer.
//!
//! This module contains only the Axum handler for the stream endpoint.
//! The delivery machinery (Manager, backends, registry) lives in the `sse`
//! crate to avoid circular dependencies.

pub mod handler;

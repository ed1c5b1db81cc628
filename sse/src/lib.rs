//! Real-time event distribution over Server-Sent Events (SSE).
//!
//! This crate pushes server-originated events to connected browser clients
//! and keeps delivery working across a fleet of instances.
//!
//! # Architecture
//!
//! - **Dual-index registry**: O(1) lookups for both connection lifecycle and
//!   user-scoped routing via separate DashMap indices. Strictly
//!   process-local; write handles are never shared between instances.
//! - **Interchangeable backends**: the in-process backend (single instance,
//!   nothing shared), the shared-store backend (Redis pub/sub fan-out,
//!   fleet-wide connection counters, durable offline queues), and the
//!   enhanced backend (shared-store plus history priming and a circuit
//!   breaker). All behind the `EventHandler` trait.
//! - **Automatic selection and fail-over**: backends are tried in preference
//!   order under a timeout at startup, and a shared-store failure during
//!   dispatch fails over mid-flight. The in-process backend always works, so
//!   delivery degrades to single-instance rather than breaking.
//! - **Offline delivery**: events targeted at a user with no connection
//!   anywhere in the fleet are queued (bounded, time-limited) and replayed
//!   on the user's next connect, before any live event.
//! - **At-least-once**: replays and fan-out can duplicate; every event
//!   carries a unique id and clients deduplicate on it.
//!
//! # Message flow
//!
//! 1. Frontend opens the SSE stream; the web layer authenticates it and
//!    calls `Manager::add_client` with a write handle.
//! 2. A controller dispatches via `Manager::send_event_to_user` or
//!    `Manager::broadcast_event`.
//! 3. The active backend frames the event once, writes it to matching local
//!    connections, publishes it to peer instances, and queues it offline if
//!    nobody in the fleet is connected.
//! 4. A background lifecycle task sweeps idle and over-age connections.

pub mod connection;
pub mod enhanced_handler;
pub mod error;
pub mod fanout;
pub mod handler;
pub mod history;
pub mod lifecycle;
pub mod local_handler;
pub mod manager;
pub mod metrics;
pub mod offline;
pub mod redis_handler;
pub mod reliability;
pub mod selector;
pub mod wire;

pub use connection::{ConnectionId, ConnectionMetadata, FrameSender};
pub use error::{Error, ErrorKind, Result};
pub use handler::{EventHandler, HandlerKind, HandlerStatus, SweepThresholds};
pub use lifecycle::LifecycleSettings;
pub use manager::Manager;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use selector::{default_factories, BackendSettings, HandlerSelector};

//! Server-side components of the stallkeeper admission service.
//!
//! ## Submodules
//!
//! - [`config`] - CLI/environment configuration and validation.
//! - [`admission`] - The two admission pools and the slot table.
//! - [`listener`] - The loop reading the inbound channel.
//! - [`pool`] - Worker spawning and the per-request worker lifecycle.
//! - [`shutdown`] - The run-duration timer and the shutdown flag.
//! - [`events`] - Lifecycle event sinks.
//! - [`service`] - Wiring of all of the above into one runnable service.
//! - [`telemetry`] - Tracing subscriber and optional OpenTelemetry export.

pub mod admission;
pub mod config;
pub mod events;
pub mod listener;
pub mod pool;
pub mod service;
pub mod shutdown;
pub mod telemetry;

//! Per-request workers.
//!
//! The listener never runs request work itself. Every frame it reads becomes
//! a [`WorkerJob`] handed to a [`Spawn`] implementation, which starts a
//! detached [`worker::run`] task. The production spawner tracks its tasks in
//! a [`TaskTracker`] so the server can wait for in-flight occupants before it
//! exits.
//!
//! [`TaskTracker`]: tokio_util::task::TaskTracker

pub mod spawner;
pub mod worker;

pub use spawner::{Spawn, SpawnError, TrackedSpawner};
pub use worker::{WorkerContext, WorkerJob};

//! Admission control: the worker pool, the resource pool and the table of
//! places behind the resource pool.
//!
//! Requests always acquire a worker slot before a resource slot and release
//! them in the opposite order. [`Admission`] bundles both leases so that
//! order holds on every path, including drops during unwinding.

pub mod controller;
pub mod slots;

pub use controller::{Admission, AdmissionController, ResourceHold, ResourceSlot, WorkerSlot};

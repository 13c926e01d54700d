//! Shared building blocks for the stallkeeper server and its clients.
//!
//! - [`protocol`] - The fixed 24-byte request/reply record.
//! - [`naming`] - Where the inbound and private reply FIFOs live.
//! - [`fifo`] - Creating, opening and removing named FIFOs.
//! - [`client`] - One request/reply exchange from the client side.
//! - [`error`] - The [`Error`] type shared by every crate in the workspace.

pub mod client;
pub mod error;
pub mod fifo;
pub mod naming;
pub mod protocol;

pub use error::{Error, Result};

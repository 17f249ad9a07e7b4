//! Bluetooth Module
//!
//! RFCOMM link to the hydraulic rig controller.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   ConnectionManager                      │
//! │  (Session loop - connect, serve commands, reconnect)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌────────────┐  ┌────────────┐  ┌──────────┐
//! │ Connection │  │ Serializer │  │ Protocol │
//! │            │  │            │  │          │
//! │ - Adapter  │  │ - FIFO     │  │ - Frames │
//! │ - Paired   │  │ - Worker   │  │ - Angle  │
//! │   lookup   │  │   thread   │  │   codec  │
//! └────────────┘  └────────────┘  └──────────┘
//!                       │
//!                       ▼
//!                 ┌──────────┐
//!                 │ Channel  │
//!                 │ (bytes)  │
//!                 └──────────┘
//! ```
//!
//! ## Modules
//!
//! - [`channel`] - Blocking byte stream abstraction and its serial-port implementation
//! - [`protocol`] - Frame layout, angle codec, upload and download
//! - [`connection`] - Adapter access, paired-device lookup, opening a link
//! - [`serializer`] - Per-link command queue and worker
//! - [`service`] - Connection state machine and session loop

pub mod channel;
pub mod connection;
pub mod protocol;
pub mod serializer;
pub mod service;

#[cfg(test)]
pub mod testing;

pub use connection::SerialAdapter;
pub use service::{ConnectionManager, LinkConfig};

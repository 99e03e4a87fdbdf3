#![cfg_attr(docsrs, feature(doc_cfg))]
//! # bt1bridge_lib
//!
//! Protocol core for Renogy solar charge controllers reached through a BT-1
//! Bluetooth module: Modbus-style request framing, reply decoding into a
//! [`telemetry::TelemetryRecord`], and a poll/dispatch engine that drives the
//! exchange over any [`dispatcher::Transport`].
//!
//! The Bluetooth link itself and the downstream consumers live outside the
//! library; they plug in through the [`dispatcher::Transport`] and
//! [`dispatcher::Sink`] traits.
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `bt1bridge` command-line tool.
//! - `ble`: Adds the Bluetooth transport and the `daemon`/`set-load` commands to the tool.

/// Contains error types for the library.
mod error;
/// Request framing, checksum and reply decoding.
pub mod protocol;
/// Telemetry record and the payload offset table.
pub mod telemetry;

pub mod dispatcher;
pub mod rate_limit;
pub mod scheduler;

pub use error::{BoxError, Error, ProtocolError};

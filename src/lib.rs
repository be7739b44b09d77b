//! A library for discovering SunSpec inverters behind a Modbus-TCP gateway.
//!
//! The scan probes a set of Modbus unit ids over a single TCP connection and
//! classifies every reply by comparing it byte for byte with the SunSpec
//! identification block an inverter returns.
//!
//! The crate is split into three layers:
//!
//! 1.  [`protocol`]: I/O free building blocks. Device ids and id sets, the
//!     transaction counter, the request frame and the reply classifier.
//! 2.  [`connection`]: the blocking [`connection::Connection`] which owns the
//!     socket and enforces the connect timeout and the retry budget. It is
//!     used through the [`connection::Transport`] trait.
//! 3.  [`scanner`]: the two-tier (fast, then slow) chunked scan with optional
//!     early exit once a target number of inverters was found.
//!
//! ## Quick Start
//!
//! ```no_run
//! use sunspec_scan_lib::{
//!     connection::{Connection, ConnectionConfig},
//!     protocol::DeviceIds,
//!     scanner::{ScanConfig, Scanner},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let connection = Connection::new(ConnectionConfig::new("192.168.1.20"));
//!     let mut scanner = Scanner::new(connection, ScanConfig::default());
//!
//!     let summary = scanner.scan(&DeviceIds::all(), |report| {
//!         println!("{}: {}", report.device_id, report.outcome);
//!     })?;
//!     println!("Inverters: {:?}", summary.inverters);
//!
//!     scanner.finish();
//!     Ok(())
//! }
//! ```

pub mod connection;
mod error;
pub mod protocol;
pub mod scanner;

pub use error::{Error, Result};

#[cfg(test)]
mod mock_server;

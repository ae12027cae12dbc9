//! Library crate for port-ledger: a bounded-concurrency TCP connect scanner
//! that appends open ports to a CSV record store.
pub mod aggregator;
pub mod clock;
pub mod connector;
pub mod error;
pub mod monitor;
pub mod ports;
pub mod resolver;
pub mod scanner;
pub mod sink;
pub mod types;

pub use error::{Result, ScanError};

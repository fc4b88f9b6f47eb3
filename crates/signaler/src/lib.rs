#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
pub mod auth;
pub mod brokers;
pub mod error;
pub mod logging;
pub mod persistence;
pub mod server;

pub use error::Error;
pub use error::Result;

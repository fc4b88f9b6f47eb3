#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
pub mod base64_bytes;
pub mod encryption;
pub mod error;
pub mod naming;
pub mod signaler;

pub use error::Error;
pub use error::Result;

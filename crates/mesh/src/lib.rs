#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
pub mod adapter;
pub mod candidates;
pub mod error;
pub mod ice;
pub mod naming;

pub use adapter::signaler_url;
pub use adapter::Adapter;
pub use adapter::AdapterConfig;
pub use adapter::Peer;
pub use naming::ID_CHANNEL;
pub use error::Error;
pub use error::Result;
pub use naming::NamedAdapter;
pub use naming::NamedAdapterConfig;

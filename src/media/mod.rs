#![forbid(unsafe_code)]

// Media module - routers, transports, producers and consumers for the
// lecture media-routing core

pub mod config;
pub mod router;
pub mod transport;
pub mod types;

pub use config::MediaConfig;
pub use router::Router;
pub use transport::{Consumer, Producer, Transport};
pub use types::{SignalError, SignalResult};

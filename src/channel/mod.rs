//! Inter-process channel pair between a client and a host.
//!
//! Both legs are Unix domain sockets named after one [`PortName`]: the host
//! listens on the service leg and serves driver calls through an
//! [`Endpoint`]; the client listens on the callback leg with a
//! [`CallbackServer`] and calls the host through a [`ClientChannel`].

pub mod client;
pub mod endpoint;
pub mod port;
pub mod protocol;

pub use client::{CallbackServer, ClientChannel};
pub use endpoint::Endpoint;
pub use port::{ChannelPaths, PortName};

//! The remote test-driver session.
//!
//! [`HostedDriver`] lives in the host and serves calls on its one sanctioned
//! thread; [`RemoteTestDriver`] is the client's proxy for it, and
//! [`KeepAlive`] pings through that proxy so the host-side watchdog stays
//! quiet while the client is alive.

mod hosted;
mod keep_alive;
mod proxy;

pub use hosted::{HostedDriver, SessionState};
pub use keep_alive::KeepAlive;
pub use proxy::RemoteTestDriver;

//! Integration tests for hostdrive
//!
//! These tests drive complete sessions over real Unix sockets: an in-process
//! endpoint talking to the client proxy, and the `hostdrive` binary running
//! as a supervised host.

pub mod executor_props;
pub mod helpers;
pub mod remote_session;
pub mod supervisor_e2e;

//! Client-side proxy for a remote test driver.

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::channel::protocol::{Call, Outcome};
use crate::channel::{CallbackServer, ChannelPaths, ClientChannel};
use crate::driver::{
    DriverOptions, ExploreReport, RunOptions, RunReport, SharedSink, TestDriver, TestPackage,
};
use crate::error::{HostError, Result};

/// Forwards [`TestDriver`] calls to a host over a channel pair.
///
/// Cheap to clone; clones share the connection, so a keep-alive can ping
/// while another clone runs tests.
#[derive(Clone)]
pub struct RemoteTestDriver {
    channel: Arc<ClientChannel>,
    callbacks: Option<Arc<CallbackServer>>,
    call_timeout: Duration,
}

impl RemoteTestDriver {
    pub fn new(
        channel: Arc<ClientChannel>,
        callbacks: Arc<CallbackServer>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            callbacks: Some(callbacks),
            call_timeout,
        }
    }

    /// Open both legs: listen for callbacks first, then connect to the service.
    pub fn connect(paths: &ChannelPaths, call_timeout: Duration) -> Result<Self> {
        let callbacks = Arc::new(CallbackServer::bind(&paths.callback)?);
        let channel = Arc::new(ClientChannel::connect(&paths.service)?);
        Ok(Self::new(channel, callbacks, call_timeout))
    }

    /// Open the service leg only.
    ///
    /// Enough for [`ping`](Self::ping) and [`shutdown`](Self::shutdown), and
    /// leaves the callback leg to whoever owns the session. Explore and run
    /// fail on such a driver.
    pub fn connect_service(paths: &ChannelPaths, call_timeout: Duration) -> Result<Self> {
        let channel = Arc::new(ClientChannel::connect(&paths.service)?);
        Ok(Self {
            channel,
            callbacks: None,
            call_timeout,
        })
    }

    /// Liveness check; also keeps the host's watchdog from firing.
    pub fn ping(&self) -> Result<()> {
        match self.request(Call::Ping, None, Some(self.call_timeout))? {
            Outcome::Pong => Ok(()),
            other => Err(unexpected("ping", &other)),
        }
    }

    /// Ask the host to end the session.
    pub fn shutdown(&self) -> Result<()> {
        match self.request(Call::Shutdown, None, Some(self.call_timeout))? {
            Outcome::Done => Ok(()),
            other => Err(unexpected("shutdown", &other)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    /// Close both legs. Every clone sees a closed channel afterwards.
    pub fn close(&self) {
        self.channel.close();
        if let Some(callbacks) = &self.callbacks {
            callbacks.close();
        }
    }

    fn request(
        &self,
        call: Call,
        sink: Option<SharedSink>,
        timeout: Option<Duration>,
    ) -> Result<Outcome> {
        let id = self.channel.next_id();
        let name = call.name();
        let callbacks = match (sink, &self.callbacks) {
            (Some(sink), Some(callbacks)) => {
                callbacks.register(id, sink);
                Some(callbacks)
            }
            (Some(_), None) => {
                return Err(HostError::invalid_operation(format!(
                    "{name} needs the callback channel, which this connection does not own"
                )))
            }
            (None, _) => None,
        };
        let result = self.channel.call(id, call, timeout);
        if let Some(callbacks) = callbacks {
            callbacks.unregister(id);
        }

        match result? {
            Outcome::Fault { kind, message } => {
                debug!(call = name, ?kind, %message, "Remote call failed");
                Err(Outcome::into_error(kind, message))
            }
            outcome => Ok(outcome),
        }
    }
}

fn unexpected(call: &str, outcome: &Outcome) -> HostError {
    HostError::Protocol(format!("unexpected response to {call}: {outcome:?}"))
}

impl TestDriver for RemoteTestDriver {
    fn initialize(&mut self, options: &DriverOptions) -> Result<()> {
        let call = Call::Initialize {
            options: options.clone(),
        };
        match self.request(call, None, Some(self.call_timeout))? {
            Outcome::Done => Ok(()),
            other => Err(unexpected("initialize", &other)),
        }
    }

    fn explore(&mut self, package: &TestPackage, sink: SharedSink) -> Result<ExploreReport> {
        let call = Call::Explore {
            package: package.clone(),
        };
        match self.request(call, Some(sink), None)? {
            Outcome::Explored(report) => Ok(report),
            other => Err(unexpected("explore", &other)),
        }
    }

    fn run(
        &mut self,
        package: &TestPackage,
        options: &RunOptions,
        sink: SharedSink,
    ) -> Result<RunReport> {
        let call = Call::Run {
            package: package.clone(),
            options: options.clone(),
        };
        match self.request(call, Some(sink), None)? {
            Outcome::Ran(report) => Ok(report),
            other => Err(unexpected("run", &other)),
        }
    }
}

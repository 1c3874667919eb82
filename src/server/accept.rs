//! Accept loop and per-connection task spawning.

use std::{any::Any, io, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::FutureExt;
use log::{error, warn};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::ServerError;
use crate::{
    broker::Broker,
    config::BrokerConfig,
    connection::Connection,
    session::ConnectionIdGenerator,
};

/// Source of incoming connections.
///
/// Dropping a pending `accept()` future must not leak resources.
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub(super) trait AcceptListener: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl AcceptListener for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> { TcpListener::local_addr(self) }
}

const MIN_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Retry timing for a listener whose `accept()` keeps failing, typically
/// because the process has run out of file descriptors.
///
/// Retries start after `first`, double on every consecutive failure and
/// never exceed `cap`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptBackoff {
    pub first: Duration,
    pub cap: Duration,
}

impl Default for AcceptBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_millis(10),
            cap: Duration::from_secs(1),
        }
    }
}

impl AcceptBackoff {
    /// Raise both delays to at least 1ms and order them so `first <= cap`.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use wirebroker::server::AcceptBackoff;
    ///
    /// let backoff = AcceptBackoff {
    ///     first: Duration::from_millis(5),
    ///     cap: Duration::ZERO,
    /// }
    /// .clamped();
    /// assert_eq!(backoff.first, Duration::from_millis(1));
    /// assert_eq!(backoff.cap, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn clamped(self) -> Self {
        let first = self.first.max(MIN_RETRY_DELAY);
        let cap = self.cap.max(MIN_RETRY_DELAY);
        Self {
            first: first.min(cap),
            cap: first.max(cap),
        }
    }

    pub(super) fn delays(self) -> RetryDelays {
        let backoff = self.clamped();
        RetryDelays {
            backoff,
            upcoming: backoff.first,
        }
    }
}

/// The running delay sequence of one accept worker.
#[derive(Debug)]
pub(super) struct RetryDelays {
    backoff: AcceptBackoff,
    upcoming: Duration,
}

impl RetryDelays {
    /// Delay before retrying after a failure; the next one doubles.
    pub(super) fn after_failure(&mut self) -> Duration {
        let delay = self.upcoming;
        self.upcoming = (delay * 2).min(self.backoff.cap);
        delay
    }

    pub(super) fn reset(&mut self) { self.upcoming = self.backoff.first; }
}

/// Everything an accept worker shares with its siblings.
pub(super) struct AcceptContext {
    pub broker: Arc<Broker>,
    pub config: Arc<BrokerConfig>,
    pub ids: Arc<ConnectionIdGenerator>,
    pub shutdown: CancellationToken,
    pub tracker: TaskTracker,
    pub backoff: AcceptBackoff,
}

/// Accept connections until `shutdown` is cancelled.
///
/// Accept failures are logged and retried after an exponentially growing
/// delay; a successful accept resets the delay.
pub(super) async fn accept_loop<L>(listener: Arc<L>, ctx: AcceptContext)
where
    L: AcceptListener + 'static,
{
    let mut delays = ctx.backoff.delays();
    loop {
        let accepted = tokio::select! {
            biased;
            () = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer_addr)) => {
                spawn_connection_task(stream, Some(peer_addr), &ctx);
                delays.reset();
            }
            Err(e) => {
                let local_addr = listener.local_addr().ok();
                let delay = delays.after_failure();
                warn!(
                    "{}: local_addr={local_addr:?}, retry_in={delay:?}",
                    ServerError::Accept(e)
                );
                tokio::select! {
                    biased;
                    () = ctx.shutdown.cancelled() => break,
                    () = sleep(delay) => {}
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&'static str>() {
        (*s).to_owned()
    } else {
        format!("{panic:?}")
    }
}

/// Run one connection on the tracker, logging and discarding any panic.
fn spawn_connection_task(stream: TcpStream, peer_addr: Option<SocketAddr>, ctx: &AcceptContext) {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: error={e}, peer_addr={peer_addr:?}");
    }
    let id = ctx.ids.next_id();
    let connection = Connection::new(id, Arc::clone(&ctx.broker), Arc::clone(&ctx.config))
        .peer_addr(peer_addr)
        .shutdown_with(&ctx.shutdown);
    ctx.tracker.spawn(async move {
        let served = std::panic::AssertUnwindSafe(connection.run(stream)).catch_unwind();
        if let Err(panic) = served.await {
            let panic_msg = panic_message(panic.as_ref());
            error!(
                "connection task panicked: connection_id={id}, panic={panic_msg}, \
                 peer_addr={peer_addr:?}"
            );
        }
    });
}

#[cfg(test)]
pub(super) fn test_context(shutdown: &CancellationToken, tracker: &TaskTracker) -> AcceptContext {
    let (broker, _reaper) = Broker::new();
    AcceptContext {
        broker,
        config: Arc::new(BrokerConfig::default()),
        ids: Arc::new(ConnectionIdGenerator::default()),
        shutdown: shutdown.clone(),
        tracker: tracker.clone(),
        backoff: AcceptBackoff {
            first: Duration::from_millis(5),
            cap: Duration::from_millis(20),
        },
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn backoff(first_ms: u64, cap_ms: u64) -> AcceptBackoff {
        AcceptBackoff {
            first: Duration::from_millis(first_ms),
            cap: Duration::from_millis(cap_ms),
        }
    }

    #[rstest]
    #[case::doubles_to_cap(backoff(5, 20), [5, 10, 20, 20])]
    #[case::cap_not_a_power(backoff(3, 10), [3, 6, 10, 10])]
    #[case::swapped_bounds(backoff(40, 10), [10, 20, 40, 40])]
    #[case::zero_delays(backoff(0, 0), [1, 1, 1, 1])]
    fn retry_delays_grow_to_the_cap(#[case] backoff: AcceptBackoff, #[case] expected: [u64; 4]) {
        let mut delays = backoff.delays();
        let observed = [(); 4].map(|()| delays.after_failure());
        assert_eq!(observed, expected.map(Duration::from_millis));
    }

    #[test]
    fn success_restarts_the_sequence() {
        let mut delays = backoff(5, 100).delays();
        delays.after_failure();
        delays.after_failure();
        delays.reset();
        assert_eq!(delays.after_failure(), Duration::from_millis(5));
    }

    #[test]
    fn panic_payloads_are_readable() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&String::from("bang")), "bang");
        assert!(panic_message(&5_u32).contains("Any"));
    }
}

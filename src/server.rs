//! Tokio-based TCP front end for the broker.
//!
//! [`BrokerServer`] carries a typestate recording whether it has been bound
//! to a listener. New servers start [`Unbound`]; [`BrokerServer::bind`] or
//! [`BrokerServer::bind_listener`] produce a [`Bound`] server that can run.
//! Running spawns the configured number of accept workers sharing one
//! listener, plus the exchange reaper. Every accepted stream becomes a
//! [`Connection`](crate::connection::Connection) whose shutdown token is a
//! child of the server's, so stopping the server hard-closes every client.

mod accept;
mod error;

use std::{
    future::Future,
    net::{SocketAddr, TcpListener as StdTcpListener},
    sync::Arc,
};

pub use accept::AcceptBackoff;
pub use error::ServerError;
use log::{info, warn};
use tokio::{net::TcpListener, signal, sync::oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use accept::{AcceptContext, accept_loop};

use crate::{
    broker::{Broker, ExchangeReaper},
    config::BrokerConfig,
    session::ConnectionIdGenerator,
};

/// Marker indicating the server has not yet bound a listener.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unbound;

/// Marker indicating the server is bound to a TCP listener.
#[derive(Debug, Clone)]
pub struct Bound {
    listener: Arc<TcpListener>,
}

/// Implemented by [`Unbound`] and [`Bound`].
pub trait ServerState: sealed::Sealed {}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Unbound {}
    impl Sealed for super::Bound {}
}

impl ServerState for Unbound {}
impl ServerState for Bound {}

/// AMQP listener serving one [`Broker`].
pub struct BrokerServer<S: ServerState = Unbound> {
    broker: Arc<Broker>,
    reaper: ExchangeReaper,
    config: Arc<BrokerConfig>,
    workers: usize,
    backoff: AcceptBackoff,
    ready_tx: Option<oneshot::Sender<()>>,
    state: S,
}

impl BrokerServer<Unbound> {
    /// Create a server with a fresh broker. One accept worker is spawned per
    /// available CPU unless [`workers`](Self::workers) says otherwise.
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let (broker, reaper) = Broker::with_config(&config);
        let workers = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self {
            broker,
            reaper,
            config: Arc::new(config),
            workers,
            backoff: AcceptBackoff::default(),
            ready_tx: None,
            state: Unbound,
        }
    }

    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> { None }

    /// Bind to `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the socket cannot be bound.
    pub fn bind(self, addr: SocketAddr) -> Result<BrokerServer<Bound>, ServerError> {
        let listener = StdTcpListener::bind(addr).map_err(ServerError::Bind)?;
        self.bind_listener(listener)
    }

    /// Serve on an already bound listener.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the listener cannot be registered
    /// with the runtime.
    pub fn bind_listener(
        self,
        listener: StdTcpListener,
    ) -> Result<BrokerServer<Bound>, ServerError> {
        listener.set_nonblocking(true).map_err(ServerError::Bind)?;
        let listener = TcpListener::from_std(listener).map_err(ServerError::Bind)?;
        let Self {
            broker,
            reaper,
            config,
            workers,
            backoff,
            ready_tx,
            ..
        } = self;
        Ok(BrokerServer {
            broker,
            reaper,
            config,
            workers,
            backoff,
            ready_tx,
            state: Bound {
                listener: Arc::new(listener),
            },
        })
    }
}

impl<S: ServerState> BrokerServer<S> {
    /// Set the number of accept workers; at least one is always spawned.
    #[must_use]
    pub fn workers(mut self, count: usize) -> Self {
        self.workers = count.max(1);
        self
    }

    #[must_use]
    pub fn backoff(mut self, backoff: AcceptBackoff) -> Self {
        self.backoff = backoff.clamped();
        self
    }

    /// Notify `tx` once every worker is accepting.
    #[must_use]
    pub fn ready_signal(mut self, tx: oneshot::Sender<()>) -> Self {
        self.ready_tx = Some(tx);
        self
    }

    /// The broker shared by every connection this server accepts.
    #[must_use]
    pub fn broker(&self) -> &Arc<Broker> { &self.broker }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig { &self.config }

    #[must_use]
    pub const fn worker_count(&self) -> usize { self.workers }
}

impl BrokerServer<Bound> {
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> { self.state.listener.local_addr().ok() }

    /// Run until Ctrl+C.
    ///
    /// # Errors
    ///
    /// Accept failures are retried with back-off and never surface here; the
    /// `Result` is kept for callers that treat the server uniformly with
    /// [`bind`](BrokerServer::bind).
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_with_shutdown(async {
            let _ = signal::ctrl_c().await;
        })
        .await
    }

    /// Run until `shutdown` resolves, then hard-close every connection and
    /// wait for their teardown.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_shutdown<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        let Self {
            broker,
            reaper,
            config,
            workers,
            backoff,
            ready_tx,
            state: Bound { listener },
        } = self;
        let shutdown_token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ids = Arc::new(ConnectionIdGenerator::default());

        tracker.spawn(reaper.run(shutdown_token.clone()));
        for _ in 0..workers {
            tracker.spawn(accept_loop(
                Arc::clone(&listener),
                AcceptContext {
                    broker: Arc::clone(&broker),
                    config: Arc::clone(&config),
                    ids: Arc::clone(&ids),
                    shutdown: shutdown_token.clone(),
                    tracker: tracker.clone(),
                    backoff,
                },
            ));
        }
        info!(
            "broker listening: local_addr={:?}, workers={workers}",
            listener.local_addr().ok()
        );

        if let Some(tx) = ready_tx
            && tx.send(()).is_err()
        {
            warn!("Failed to send readiness signal: receiver dropped");
        }

        shutdown.await;
        info!("broker shutting down: connections={}", broker.connections().len());
        shutdown_token.cancel();
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

//! The SMTP server: listening socket, session registry, and per-connection
//! task spawning.
//!
//! The acceptor owns the listener and a registry of live sessions. Session
//! ids come from a lock-free atomic counter; registry membership (including
//! the capacity check) is guarded by a single mutex. The two are independent
//! so session cleanup never serializes against accept throughput.

mod address_parser;
mod command;
mod connection;
mod smtp_protocol;
mod state;
mod tls;


use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::select;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::Config;
use crate::relay::RelayQueue;
use crate::repository::Repository;

pub use address_parser::Address;
pub use smtp_protocol::Session;

/// What the acceptor keeps about a live session. The session's own fields
/// are never touched from here.
#[derive(Debug)]
struct SessionHandle {
    remote_addr: SocketAddr,
    cancel: CancellationToken,
}

/// Shared map of live sessions, capacity check included.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<Mutex<HashMap<u64, SessionHandle>>>,
}

impl SessionRegistry {
    /// Inserts the session iff the registry is under `cap`. The size check
    /// and the insert share one critical section so the cap holds under
    /// bursts.
    fn admit(&self, id: u64, handle: SessionHandle, cap: usize) -> bool {
        let mut sessions = self.lock();
        if sessions.len() >= cap {
            return false;
        }
        sessions.insert(id, handle);
        true
    }

    /// Removes the session. Idempotent.
    fn remove(&self, id: u64) {
        self.lock().remove(&id);
    }

    /// Number of live sessions.
    pub fn count(&self) -> usize {
        self.lock().len()
    }

    fn cancel_all(&self) {
        for (id, handle) in self.lock().iter() {
            debug!("cancelling session {} from {}", id, handle.remote_addr);
            handle.cancel.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, SessionHandle>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The SMTP acceptor: listener, registry, and session spawning.
pub struct Server {
    config: Arc<Config>,
    repository: Arc<dyn Repository>,
    relay: Arc<dyn RelayQueue>,
    tls_acceptor: Option<TlsAcceptor>,
    sessions: SessionRegistry,
    next_session_id: AtomicU64,
    accept_shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Server {
    /// Creates the server, building the TLS acceptor the configuration
    /// describes (if any).
    pub fn new(
        config: Config,
        repository: Arc<dyn Repository>,
        relay: Arc<dyn RelayQueue>,
    ) -> Result<Self> {
        let tls_acceptor = tls::acceptor(&config)?;
        if tls_acceptor.is_some() {
            info!("STARTTLS enabled");
        }
        Ok(Server {
            config: Arc::new(config),
            repository,
            relay,
            tls_acceptor,
            sessions: SessionRegistry::default(),
            next_session_id: AtomicU64::new(1),
            accept_shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        })
    }

    /// A handle onto the live-session registry, e.g. for the health server.
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    /// Runs the accept loop until shutdown or an accept error.
    ///
    /// Each accepted connection gets a fresh id and is admitted against the
    /// session cap; over-cap connections are dropped without a greeting so
    /// capacity is preserved for the sessions already being served.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if binding the listener fails or if `accept` itself
    /// fails. Errors inside individual sessions are logged, never propagated.
    pub async fn run(&self) -> Result<()> {
        let addr = format!("{}:{}", self.config.bind_address, self.config.port);
        let listener = TcpListener::bind(&addr).await?;

        info!("SMTP server listening on {}", addr);

        loop {
            let (stream, remote_addr) = select! {
                _ = self.accept_shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("error accepting connection: {}", e);
                        return Err(e.into());
                    }
                },
            };

            let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let handle = SessionHandle {
                remote_addr,
                cancel: cancel.clone(),
            };
            if !self.sessions.admit(id, handle, self.config.max_sessions) {
                warn!(
                    "session capacity reached, dropping connection from {}",
                    remote_addr
                );
                continue;
            }

            info!("new connection from {} (session {})", remote_addr, id);
            let session = Session::new(
                id,
                stream,
                Arc::clone(&self.config),
                Arc::clone(&self.repository),
                Arc::clone(&self.relay),
                self.tls_acceptor.clone(),
                cancel,
            );
            let sessions = self.sessions.clone();
            self.tracker.spawn(async move {
                if let Err(e) = session.run().await {
                    error!("error handling session {} from {}: {:#}", id, remote_addr, e);
                }
                sessions.remove(id);
                debug!("session {} finished", id);
            });
        }

        Ok(())
    }

    /// Stops accepting, lets sessions drain for the configured grace period,
    /// then cancels whatever is left.
    pub async fn shutdown(&self) {
        self.accept_shutdown.cancel();
        self.tracker.close();
        let grace = Duration::from_secs(self.config.shutdown_grace_secs);
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!("forcing {} open sessions closed", self.sessions.count());
            self.sessions.cancel_all();
            self.tracker.wait().await;
        }
    }
}

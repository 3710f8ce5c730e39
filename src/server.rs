//! TCP server for the contact menu.
//!
//! Accepts connections and admits each one through two gates, in order:
//! the per-address rate limiter, then the global session budget. Admitted
//! connections run as their own task; rejected ones get a one-line notice
//! and are closed straight away.

use crate::admission::{AdmissionController, SessionTracker};
use crate::config::Config;
use crate::protocol::{Menu, RATE_LIMITED, SERVER_BUSY};
use crate::rate_limit::{source_key, RateLimiter};
use crate::session::{self, SessionEnd, SessionLimits};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Pending connection backlog for the listening socket
const LISTEN_BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    listener: TcpListener,
    limiter: Arc<RateLimiter>,
    admission: Arc<AdmissionController>,
    sessions: SessionTracker,
    menu: Arc<Menu>,
    limits: SessionLimits,
}

impl Server {
    /// Bind the listening socket. Failing here is fatal for the process.
    pub async fn bind(config: Config) -> io::Result<Self> {
        let addr: SocketAddr = config
            .listen
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let listener = TcpListener::from_std(create_listener(addr)?)?;

        Ok(Server {
            limiter: Arc::new(RateLimiter::new(
                config.rate_limit_window,
                config.rate_limit_max,
            )),
            admission: Arc::new(AdmissionController::new(config.max_connections)),
            sessions: SessionTracker::new(),
            menu: Arc::new(Menu::new(config.contacts.clone())),
            limits: SessionLimits::from(&config),
            listener,
            config,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until `shutdown` completes, then drain sessions.
    ///
    /// Once `shutdown` fires the listening socket is closed, the sweeper
    /// is stopped, and the call waits up to the configured grace period
    /// for running sessions to finish. Sessions still running after that
    /// are left to the runtime.
    pub async fn run<F>(self, shutdown: F) -> io::Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(
            address = %self.local_addr()?,
            max_connections = self.config.max_connections,
            rate_limit_max = self.config.rate_limit_max,
            rate_limit_window = ?self.config.rate_limit_window,
            "Server listening"
        );

        // Start the rate limit cleanup task
        let (stop_tx, stop_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_task(
            Arc::clone(&self.limiter),
            self.config.rate_limit_cleanup_interval,
            stop_rx,
        ));

        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown signal received, stopping new connections");
                    break;
                }

                result = self.listener.accept() => match result {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },
            }
        }

        // Closing the socket makes further connection attempts fail
        let Server {
            listener,
            sessions,
            config,
            ..
        } = self;
        drop(listener);

        let _ = stop_tx.send(true);
        if let Err(e) = sweeper.await {
            warn!(error = %e, "Rate limit sweeper ended abnormally");
        }

        info!(
            active = sessions.active(),
            grace = ?config.shutdown_grace,
            "Waiting for active connections to close"
        );
        if sessions.wait_idle(config.shutdown_grace).await {
            info!("All connections closed");
        } else {
            warn!(
                abandoned = sessions.active(),
                "Grace period elapsed with connections still open"
            );
        }

        Ok(())
    }

    /// Admit or reject one accepted connection. Never waits on the peer.
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let key = source_key(&peer);

        if !self.limiter.check(key) {
            warn!(peer = %key, "Connection rejected: rate limit exceeded");
            reject(stream, RATE_LIMITED);
            return;
        }

        let max = self.admission.capacity();
        let Some(slot) = self.admission.try_acquire() else {
            warn!(
                peer = %key,
                in_use = self.admission.in_use(),
                max,
                "Connection rejected: max connections reached"
            );
            reject(stream, SERVER_BUSY);
            return;
        };

        let (guard, active) = self.sessions.enter();
        info!(peer = %peer, active, max, "New connection");

        let menu = Arc::clone(&self.menu);
        let limits = self.limits;
        let span = info_span!("session", peer = %peer);

        tokio::spawn(
            async move {
                match session::handle_connection(stream, &menu, &limits).await {
                    Ok(SessionEnd::TimedOut) => debug!("Session timed out"),
                    Ok(end) => trace!(?end, "Session ended"),
                    Err(e) => debug!(error = %e, "Connection error"),
                }

                info!(active = guard.remaining(), max, "Connection closed");
                // Released here, or during unwinding if the session panicked
                drop(guard);
                drop(slot);
            }
            .instrument(span),
        );
    }

    #[cfg(test)]
    pub fn limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    #[cfg(test)]
    pub fn admission(&self) -> Arc<AdmissionController> {
        Arc::clone(&self.admission)
    }

    #[cfg(test)]
    pub fn sessions(&self) -> SessionTracker {
        self.sessions.clone()
    }
}

/// Send a rejection notice without blocking, then close.
fn reject(stream: TcpStream, notice: &[u8]) {
    // A fresh socket has an empty send buffer, so this only fails if the
    // peer is already gone
    if let Err(e) = stream.try_write(notice) {
        trace!(error = %e, "Failed to send rejection notice");
    }
}

/// Background task to evict stale rate limit records
async fn sweep_task(limiter: Arc<RateLimiter>, every: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if limiter.is_empty() {
                    continue;
                }
                let removed = limiter.sweep();
                trace!(removed, tracked = limiter.len(), "Rate limit sweep");
            }
            _ = stop.changed() => break,
        }
    }
}

/// Create a TCP listener with SO_REUSEADDR so restarts can rebind at once.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(socket.into())
}

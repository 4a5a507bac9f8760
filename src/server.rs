//! The server: listener, accept loop and coordinated shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::conn::{ClientStream, Conn};
use crate::error::{Error, Result};
use crate::mux::Mux;

/// Callback invoked with the connection ID every time a connection closes.
pub type OnCloseHandler = Arc<dyn Fn(u64) + Send + Sync>;

struct ServerState {
    listener_ready: bool,
    local_addr: Option<SocketAddr>,
    on_close: Option<OnCloseHandler>,
    notify_shutdown: Option<broadcast::Sender<()>>,
    drain_tx: Option<mpsc::Sender<()>>,
    drain_rx: Option<mpsc::Receiver<()>>,
}

/// An embeddable LDAP server.
///
/// Construct one, install a [`Mux`], then [`run`](Server::run) it. The
/// lifecycle is terminal: `Idle -> Listening (run) -> Draining (stop) ->
/// Stopped`; a stopped server cannot be run again.
///
/// ```no_run
/// use std::sync::Arc;
/// use ldapserve::{AuthChoice, Config, Mux, Server};
///
/// # async fn example() -> ldapserve::Result<()> {
/// let mut mux = Mux::new();
/// mux.bind(AuthChoice::Simple, |mut writer, request| async move {
///     let _ = writer.write(request.new_bind_response()).await;
/// });
/// let server = Arc::new(Server::new(Config::default()));
/// server.router(mux);
/// server.run("127.0.0.1:389").await
/// # }
/// ```
pub struct Server {
    config: Config,
    router: Arc<ArcSwap<Mux>>,
    state: RwLock<ServerState>,
}

impl Server {
    /// Create an idle server. The shutdown plumbing is armed here so that
    /// [`stop`](Server::stop) works whether or not the server ever ran.
    pub fn new(config: Config) -> Server {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (drain_tx, drain_rx) = mpsc::channel(1);
        Server {
            config,
            router: Arc::new(ArcSwap::from_pointee(Mux::new())),
            state: RwLock::new(ServerState {
                listener_ready: false,
                local_addr: None,
                on_close: None,
                notify_shutdown: Some(notify_shutdown),
                drain_tx: Some(drain_tx),
                drain_rx: Some(drain_rx),
            }),
        }
    }

    /// Install the route table. Swapping it while the server runs affects
    /// subsequent requests; dispatches already in flight keep the router
    /// they loaded.
    pub fn router(&self, mux: Mux) {
        self.router.store(Arc::new(mux));
    }

    /// Register a callback invoked with the connection ID each time a
    /// connection closes. Fires exactly once per connection.
    pub async fn on_close(&self, handler: impl Fn(u64) + Send + Sync + 'static) {
        self.state.write().await.on_close = Some(Arc::new(handler));
    }

    /// Whether the listener is bound and accepting.
    pub async fn ready(&self) -> bool {
        self.state.read().await.listener_ready
    }

    /// The bound listener address, once [`run`](Server::run) has bound it.
    /// Useful when binding to port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.state.read().await.local_addr
    }

    /// Bind `addr` and serve plain LDAP until [`stop`](Server::stop).
    pub async fn run(&self, addr: &str) -> Result<()> {
        self.run_inner(addr, None).await
    }

    /// Bind `addr` and serve LDAPS: every accepted connection is TLS from
    /// the first byte, distinct from the in-band STARTTLS upgrade.
    pub async fn run_tls(&self, addr: &str, tls_config: Arc<rustls::ServerConfig>) -> Result<()> {
        self.run_inner(addr, Some(TlsAcceptor::from(tls_config)))
            .await
    }

    async fn run_inner(&self, addr: &str, acceptor: Option<TlsAcceptor>) -> Result<()> {
        let (notify_shutdown, drain_tx) = {
            let state = self.state.read().await;
            let notify = state.notify_shutdown.clone().ok_or(Error::Closed)?;
            let drain = state.drain_tx.clone().ok_or(Error::Closed)?;
            (notify, drain)
        };
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        {
            let mut state = self.state.write().await;
            state.local_addr = Some(local_addr);
            state.listener_ready = true;
        }
        info!(
            "listening on {}{}",
            local_addr,
            if acceptor.is_some() { " (ldaps)" } else { "" }
        );

        let mut shutdown_rx = notify_shutdown.subscribe();
        let mut conn_id: u64 = 0;
        loop {
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = shutdown_rx.recv() => {
                    debug!("accept loop: shutdown observed");
                    return Ok(());
                }
            };
            let (socket, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    error!("error accepting conn: {}", err);
                    return Err(Error::Io(err));
                }
            };
            conn_id += 1;
            debug!("conn {}: accepted from {}", conn_id, peer_addr);

            let id = conn_id;
            let router = Arc::clone(&self.router);
            let shutdown = notify_shutdown.subscribe();
            let drain = drain_tx.clone();
            let acceptor = acceptor.clone();
            let on_close = self.state.read().await.on_close.clone();
            let read_timeout = self.config.read_timeout();
            let write_timeout = self.config.write_timeout();
            let disable_panic_recovery = self.config.disable_panic_recovery;
            tokio::spawn(async move {
                // Dropping this sender clone is what stop() waits on.
                let _drain = drain;
                let stream = match acceptor {
                    Some(acceptor) => match acceptor.accept(socket).await {
                        Ok(tls_stream) => ClientStream::Tls(tls_stream),
                        Err(err) => {
                            error!("conn {}: TLS handshake failed: {}", id, err);
                            if let Some(on_close) = on_close {
                                on_close(id);
                            }
                            return;
                        }
                    },
                    None => ClientStream::Tcp(socket),
                };
                let mut conn = Conn::new(
                    id,
                    stream,
                    router,
                    shutdown,
                    read_timeout,
                    write_timeout,
                    disable_panic_recovery,
                );
                if let Err(err) = conn.serve().await {
                    error!("conn {}: {}", id, err);
                }
                conn.close().await;
                if let Some(on_close) = on_close {
                    on_close(id);
                }
                debug!("conn {}: closed", id);
            });
        }
    }

    /// Stop a running server: fire the shutdown signal, then wait for the
    /// accept loop and every connection worker to drain. In-flight handlers
    /// run to completion first. Returns `Ok` on a server that never ran.
    pub async fn stop(&self) -> Result<()> {
        let (notify_shutdown, drain_tx, drain_rx) = {
            let mut state = self.state.write().await;
            (
                state.notify_shutdown.take(),
                state.drain_tx.take(),
                state.drain_rx.take(),
            )
        };
        if notify_shutdown.is_none() && drain_rx.is_none() {
            debug!("stop: nothing to do");
            return Ok(());
        }
        debug!("shutting down");
        if let Some(notify_shutdown) = notify_shutdown {
            // Err means no live receivers, i.e. the server never ran.
            let _ = notify_shutdown.send(());
        }
        drop(drain_tx);
        if let Some(mut drain_rx) = drain_rx {
            debug!("waiting on connections to close");
            let _ = drain_rx.recv().await;
        }
        debug!("stopped");
        Ok(())
    }
}

//! Per-connection state and the request serving loop.
//!
//! Each accepted socket gets exactly one [`Conn`] with one read loop.
//! Writes go through the connection's mutex-guarded write half, so PDUs
//! from the [`crate::response::ResponseWriter`] never interleave. Requests
//! are dispatched sequentially in arrival order; each handler runs as its
//! own task so a panic can be caught without tearing down the server.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, warn};

use crate::ber::{self, Packet};
use crate::error::{Error, Result};
use crate::message::{APP_ABANDON_REQUEST, APP_UNBIND_REQUEST};
use crate::mux::Mux;
use crate::request::Request;
use crate::response::ResponseWriter;

const NO_ROUTE_DIAGNOSTIC: &str = "no route for operation";

/// Client stream: plain TCP or TLS (LDAPS at accept, or STARTTLS later).
pub(crate) enum ClientStream {
    Tcp(TcpStream),
    Tls(TlsStream<TcpStream>),
}

impl ClientStream {
    fn into_split(self) -> (ClientReadHalf, ClientWriteHalf) {
        match self {
            ClientStream::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (ClientReadHalf::Tcp(r), ClientWriteHalf::Tcp(w))
            }
            ClientStream::Tls(stream) => {
                let (r, w) = tokio::io::split(stream);
                (ClientReadHalf::Tls(r), ClientWriteHalf::Tls(w))
            }
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, ClientStream::Tls(_))
    }
}

pub(crate) enum ClientReadHalf {
    Tcp(tokio::net::tcp::OwnedReadHalf),
    Tls(tokio::io::ReadHalf<TlsStream<TcpStream>>),
}

pub(crate) enum ClientWriteHalf {
    Tcp(tokio::net::tcp::OwnedWriteHalf),
    Tls(tokio::io::WriteHalf<TlsStream<TcpStream>>),
}

impl AsyncRead for ClientReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientReadHalf::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            ClientReadHalf::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientWriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_flush(cx),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            ClientWriteHalf::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            ClientWriteHalf::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connection state shared with requests and response writers.
pub(crate) struct ConnShared {
    id: u64,
    write_half: Mutex<Option<ClientWriteHalf>>,
    write_timeout: Option<Duration>,
    pending_tls: StdMutex<Option<Arc<rustls::ServerConfig>>>,
    tls_active: AtomicBool,
}

impl ConnShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn tls_active(&self) -> bool {
        self.tls_active.load(Ordering::Acquire)
    }

    /// Write one encoded PDU under the write lock, honoring the write
    /// deadline when one is configured.
    pub(crate) async fn write_pdu(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.write_half.lock().await;
        let half = guard.as_mut().ok_or(Error::Closed)?;
        let write = async {
            half.write_all(bytes).await?;
            half.flush().await
        };
        match self.write_timeout {
            Some(deadline) => tokio::time::timeout(deadline, write)
                .await
                .map_err(|_| {
                    Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "write deadline exceeded",
                    ))
                })?
                .map_err(Error::Io),
            None => write.await.map_err(Error::Io),
        }
    }

    /// Record a TLS upgrade to be performed by the read loop once the
    /// current handler returns.
    pub(crate) fn schedule_tls(&self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        if self.tls_active() {
            return Err(Error::invalid("connection is already secured with TLS"));
        }
        let mut pending = self
            .pending_tls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if pending.is_some() {
            return Err(Error::invalid("a TLS upgrade is already pending"));
        }
        *pending = Some(config);
        Ok(())
    }

    fn take_pending_tls(&self) -> Option<Arc<rustls::ServerConfig>> {
        self.pending_tls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// A ConnShared with no socket behind it; writes report `Closed`.
    #[cfg(test)]
    pub(crate) fn detached(id: u64) -> Arc<Self> {
        Arc::new(ConnShared {
            id,
            write_half: Mutex::new(None),
            write_timeout: None,
            pending_tls: StdMutex::new(None),
            tls_active: AtomicBool::new(false),
        })
    }
}

pub(crate) struct Conn {
    shared: Arc<ConnShared>,
    read_half: Option<ClientReadHalf>,
    buffer: BytesMut,
    router: Arc<ArcSwap<Mux>>,
    shutdown: broadcast::Receiver<()>,
    read_timeout: Option<Duration>,
    disable_panic_recovery: bool,
}

impl Conn {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u64,
        stream: ClientStream,
        router: Arc<ArcSwap<Mux>>,
        shutdown: broadcast::Receiver<()>,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
        disable_panic_recovery: bool,
    ) -> Conn {
        let tls_active = stream.is_tls();
        let (read_half, write_half) = stream.into_split();
        Conn {
            shared: Arc::new(ConnShared {
                id,
                write_half: Mutex::new(Some(write_half)),
                write_timeout,
                pending_tls: StdMutex::new(None),
                tls_active: AtomicBool::new(tls_active),
            }),
            read_half: Some(read_half),
            buffer: BytesMut::with_capacity(4 * 1024),
            router,
            shutdown,
            read_timeout,
            disable_panic_recovery,
        }
    }

    /// Serve requests until the client disconnects, a terminal error
    /// occurs, or the server shuts down.
    pub(crate) async fn serve(&mut self) -> Result<()> {
        loop {
            let read_half = self.read_half.as_mut().ok_or(Error::Closed)?;
            let packet = tokio::select! {
                res = ber::read_packet(read_half, &mut self.buffer, self.read_timeout) => {
                    match res? {
                        Some(packet) => packet,
                        None => {
                            debug!("conn {}: client disconnected", self.shared.id);
                            return Ok(());
                        }
                    }
                }
                _ = self.shutdown.recv() => {
                    debug!("conn {}: shutting down", self.shared.id);
                    return Ok(());
                }
            };
            match packet.request_tag() {
                APP_UNBIND_REQUEST => {
                    debug!("conn {}: unbind", self.shared.id);
                    return Ok(());
                }
                // AbandonRequest gets no response per RFC 4511; handlers run
                // to completion regardless.
                APP_ABANDON_REQUEST => {
                    debug!("conn {}: abandon ignored", self.shared.id);
                    continue;
                }
                _ => {}
            }
            self.dispatch(packet).await?;
            if let Some(config) = self.shared.take_pending_tls() {
                self.upgrade_tls(config).await?;
            }
        }
    }

    async fn dispatch(&mut self, packet: Packet) -> Result<()> {
        let request = Request::new(Arc::clone(&self.shared), &packet)?;
        let request_id = request.id();
        let mut writer = ResponseWriter::new(Arc::clone(&self.shared), request_id);
        // Load the router once per request so hot swaps apply to the next
        // request, never mid-dispatch.
        let router = self.router.load_full();
        match router.route(&request) {
            Some(matched) => {
                debug!(
                    "conn {}: request {} matched {} route",
                    self.shared.id,
                    request_id,
                    request.route_operation()
                );
                let future = (matched)(writer, request);
                match tokio::spawn(future).await {
                    Ok(()) => Ok(()),
                    Err(join_error) if join_error.is_panic() => {
                        if self.disable_panic_recovery {
                            std::panic::resume_unwind(join_error.into_panic());
                        }
                        error!(
                            "conn {}: handler panicked serving request {}",
                            self.shared.id, request_id
                        );
                        Err(Error::Internal(format!(
                            "handler panic on request {}",
                            request_id
                        )))
                    }
                    Err(_) => Err(Error::Internal("handler task cancelled".to_string())),
                }
            }
            None => {
                warn!(
                    "conn {}: no route for {} request {}",
                    self.shared.id,
                    request.route_operation(),
                    request_id
                );
                let reply = request
                    .new_response()
                    .with_application_code(request.response_application_code())
                    .with_diagnostic_message(NO_ROUTE_DIAGNOSTIC);
                writer.write(reply).await
            }
        }
    }

    /// Perform the STARTTLS handshake scheduled by a handler. The read loop
    /// is the caller, so no read is in flight during the swap.
    async fn upgrade_tls(&mut self, config: Arc<rustls::ServerConfig>) -> Result<()> {
        if !self.buffer.is_empty() {
            return Err(Error::protocol(
                "client sent plaintext ahead of the TLS handshake",
            ));
        }
        let write_half = self
            .shared
            .write_half
            .lock()
            .await
            .take()
            .ok_or(Error::Closed)?;
        let read_half = self
            .read_half
            .take()
            .ok_or_else(|| Error::Internal("read half already taken".to_string()))?;
        let stream = match (read_half, write_half) {
            (ClientReadHalf::Tcp(r), ClientWriteHalf::Tcp(w)) => r
                .reunite(w)
                .map_err(|e| Error::Internal(format!("reunite failed: {}", e)))?,
            _ => {
                return Err(Error::invalid("connection is already secured with TLS"));
            }
        };
        let acceptor = TlsAcceptor::from(config);
        let tls_stream = acceptor
            .accept(stream)
            .await
            .map_err(|e| Error::Tls(e.to_string()))?;
        debug!("conn {}: TLS upgrade complete", self.shared.id);
        let (read_half, write_half) = tokio::io::split(tls_stream);
        self.read_half = Some(ClientReadHalf::Tls(read_half));
        *self.shared.write_half.lock().await = Some(ClientWriteHalf::Tls(write_half));
        self.shared.tls_active.store(true, Ordering::Release);
        Ok(())
    }

    /// Release the socket. The on-close callback is the server's to run;
    /// it fires exactly once per connection regardless of how serve ended.
    pub(crate) async fn close(&mut self) {
        let mut guard = self.shared.write_half.lock().await;
        if let Some(half) = guard.as_mut() {
            let _ = half.shutdown().await;
        }
        *guard = None;
        self.read_half = None;
    }
}

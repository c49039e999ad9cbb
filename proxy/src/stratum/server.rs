/// Stratum proxy server - accept loop and session supervision
///
/// Each accepted connection gets a fresh session id and the nonce partition
/// derived from it, and runs as its own task on a shared tracker. Cancelling
/// the server token stops accepting and winds every session down.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::session::{ClientSession, SessionContext};
use crate::error::{ProxyError, Result};
use crate::pow::Uint128;

pub struct ProxyServer {
    ctx: Arc<SessionContext>,
    server_id: [u8; 8],
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl ProxyServer {
    pub fn new(ctx: Arc<SessionContext>, server_id: [u8; 8], shutdown: CancellationToken) -> Self {
        tracing::info!(server_id = %hex::encode(server_id), "Creating Stratum proxy");

        Self {
            ctx,
            server_id,
            next_id: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Bind with SO_REUSEADDR so a restart does not trip over TIME_WAIT.
    pub fn bind(addr: &str) -> Result<TcpListener> {
        let sock_addr: SocketAddr = addr.parse().map_err(|e| {
            ProxyError::Transport(std::io::Error::new(
                ErrorKind::InvalidInput,
                format!("Invalid address '{}': {}", addr, e),
            ))
        })?;

        let socket = socket2::Socket::new(
            socket2::Domain::for_address(sock_addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&sock_addr.into())?;
        socket.listen(1024)?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener)?;

        tracing::info!("Stratum proxy listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Accept until cancelled, then wait for every session to finish.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let result = self.accept_loop(&listener).await;

        drop(listener);
        self.ctx.tasks.close();
        self.ctx.registry.close_all();
        self.ctx.tasks.wait().await;

        tracing::info!("Stratum proxy stopped");
        result
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                r = listener.accept() => r,
            };

            match accepted {
                Ok((socket, peer)) => self.spawn_session(socket, peer),
                Err(e) if matches!(e.kind(), ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset) => {
                    tracing::warn!("Accept failed: {}", e);
                }
                Err(e) => {
                    tracing::error!("Listener failed: {}", e);
                    return Err(e.into());
                }
            }
        }
    }

    fn spawn_session(&self, socket: TcpStream, peer: SocketAddr) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        if let Err(e) = set_keepalive(&socket, self.ctx.policy.timeouts.keepalive()) {
            tracing::warn!(session = id, peer = %peer, "Keep-alive setup failed: {}", e);
        }
        let _ = socket.set_nodelay(true);

        let nonce_part1 = Uint128::nonce_partition(self.server_id, id);
        let session = ClientSession::new(
            id,
            nonce_part1,
            peer,
            self.ctx.clone(),
            self.shutdown.child_token(),
        );

        let span = tracing::info_span!("session", session = id, peer = %peer);
        self.ctx.tasks.spawn(
            async move {
                tracing::debug!("Connection accepted");
                let (reader, writer) = socket.into_split();
                match session.run(reader, writer).await {
                    Ok(()) | Err(ProxyError::Eof) => tracing::debug!("Session closed"),
                    Err(e) => tracing::info!("Session ended: {}", e),
                }
            }
            .instrument(span),
        );
    }
}

fn set_keepalive(socket: &TcpStream, interval: Duration) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(interval);
    SockRef::from(socket).set_tcp_keepalive(&keepalive)
}

//! Pool-driven accept loop shared by the stream decoys

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

/// A bound listener the acceptor can pull connections from
#[async_trait]
pub trait DecoyListener: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept one connection and describe its peer
    async fn accept_peer(&self) -> io::Result<(Self::Stream, String)>;
}

#[async_trait]
impl DecoyListener for TcpListener {
    type Stream = tokio::net::TcpStream;

    async fn accept_peer(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = self.accept().await?;
        Ok((stream, peer.to_string()))
    }
}

#[async_trait]
impl DecoyListener for UnixListener {
    type Stream = tokio::net::UnixStream;

    async fn accept_peer(&self) -> io::Result<(Self::Stream, String)> {
        let (stream, peer) = self.accept().await?;
        let peer = peer
            .as_pathname()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "unix".to_string());
        Ok((stream, peer))
    }
}

/// Which decoy a listener belongs to, as shown in reports
#[derive(Debug, Clone)]
pub struct ServiceTag {
    pub kind: ProtocolKind,
    pub name: String,
}

impl ServiceTag {
    pub fn new(kind: ProtocolKind, name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
        }
    }
}

/// Accept connections forever.
///
/// Each iteration submits one accept to the pool, so at most `capacity`
/// accepts and connected-reports are in flight. Handlers run on their own
/// tasks and do not hold a pool slot. Pending accepts are cancelled when this
/// future is dropped; the listener is closed once `pool` has drained.
pub async fn accept_loop<L, H, Fut>(
    listener: L,
    tag: ServiceTag,
    pool: WorkerPool,
    reporter: Reporter,
    accept_delay: Duration,
    handler: H,
) where
    L: DecoyListener,
    H: Fn(L::Stream, Session) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = Arc::new(listener);
    let handler = Arc::new(handler);
    let tag = Arc::new(tag);
    let (_alive, alive_rx) = watch::channel(());
    let kind = tag.kind;

    loop {
        let listener = listener.clone();
        let handler = handler.clone();
        let tag = tag.clone();
        let reporter = reporter.clone();
        let mut alive = alive_rx.clone();

        let task = async move {
            let accepted = tokio::select! {
                accepted = async {
                    if !accept_delay.is_zero() {
                        tokio::time::sleep(accept_delay).await;
                    }
                    listener.accept_peer().await
                } => accepted,
                _ = alive.changed() => return,
            };
            drop(listener);

            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("{} accept error on 127.0.0.1: {}", tag.kind, e);
                    return;
                }
            };

            debug!("{} connection from {}", tag.kind, peer);
            let session = reporter.open_session(tag.kind, &tag.name, &peer).await;
            tokio::spawn(handler(stream, session));
        };

        if pool.submit(task).await.is_err() {
            debug!("{} accept loop stopped: pool closed", kind);
            return;
        }
    }
}

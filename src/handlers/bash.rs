//! Bash keepalive decoy on a Unix domain socket
//!
//! Anything written to the socket is reported verbatim; nothing is answered.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use super::acceptor::{accept_loop, ServiceTag};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "BASH decoy";

/// Bind `socket_path`, replacing a stale socket file, and open it to all users
pub async fn start(socket_path: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let path = PathBuf::from(socket_path);
    remove_stale(&path)?;

    let listener = UnixListener::bind(&path).with_context(|| format!("binding {}", path.display()))?;
    if let Err(e) = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666)) {
        warn!("Bash socket chmod failed on 127.0.0.1: {}", e);
    }
    info!("Bash honeypot started on {}", path.display());

    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Bash, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone()),
    ));

    Ok(Listening::new(socket_path.to_string(), task).with_pool(pool).with_socket_file(path))
}

fn remove_stale(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed stale socket {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing stale socket {}", path.display())),
    }
}

pub async fn handle<S>(mut stream: S, session: Session, reporter: Reporter)
where
    S: AsyncRead + Unpin + Send,
{
    let mut buf = vec![0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                debug!("BASH chunk from {}: {:?}", session.remote_addr, chunk);
                reporter.spawn_update(&session, chunk);
            }
            Err(e) => {
                debug!("BASH read error from {}: {}", session.remote_addr, e);
                break;
            }
        }
    }
}

//! FTP honeypot handler

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::acceptor::{accept_loop, ServiceTag};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "FTP 21 decoy";

const IDLE_TIMEOUT: Duration = Duration::from_secs(120);

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("FTP honeypot started on {}", local_addr);

    let banner: Arc<str> = Arc::from(ctx.emulation.ftp_banner.as_str());
    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Ftp, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), banner.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

/// Reply for one command line, and whether the session ends after it
fn reply(command: &str) -> (&'static str, bool) {
    match command {
        "USER" => ("331 Please specify the password.", false),
        "PASS" => ("530 Login incorrect.", false),
        "QUIT" => ("221 Goodbye.", true),
        "SYST" => ("215 UNIX Type: L8", false),
        "PWD" | "XPWD" => ("257 \"/\" is the current directory", false),
        "TYPE" => ("200 Switching to Binary mode.", false),
        "PASV" => ("227 Entering Passive Mode (127,0,0,1,100,100).", false),
        "LIST" | "NLST" => ("150 Here comes the directory listing.\r\n226 Directory send OK.", false),
        "FEAT" => ("211-Features:\r\n PASV\r\n UTF8\r\n211 End", false),
        "NOOP" => ("200 NOOP ok.", false),
        _ => ("502 Command not implemented.", false),
    }
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, banner: Arc<str>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    if writer.write_all(format!("{}\r\n", banner).as_bytes()).await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        let read = tokio::time::timeout(IDLE_TIMEOUT, (&mut reader).take(4096).read_line(&mut line)).await;
        match read {
            Ok(Ok(0)) | Ok(Err(_)) => break,
            Err(_) => {
                debug!("FTP idle timeout for {}", session.remote_ip());
                break;
            }
            Ok(Ok(_)) => {}
        }

        let cmd = line.trim();
        if cmd.is_empty() {
            continue;
        }
        reporter.spawn_update(&session, format!("&&{}", cmd));

        let verb = cmd.split_whitespace().next().unwrap_or_default().to_ascii_uppercase();
        let (text, done) = reply(&verb);
        if writer.write_all(format!("{}\r\n", text).as_bytes()).await.is_err() || done {
            break;
        }
    }
}

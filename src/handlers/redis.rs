//! Redis decoy speaking a RESP subset
//!
//! `SET`/`GET` hit a store shared by every connection to the same listener, so
//! a value written on one connection can be read back on another.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::acceptor::{accept_loop, ServiceTag};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "Redis 6379 decoy";

const MAX_ARGS: usize = 1024;
const MAX_BULK: usize = 1024 * 1024;

pub type RedisStore = Arc<Mutex<HashMap<String, String>>>;

pub async fn start(addr: &str, ctx: Arc<HandlerContext>) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Redis honeypot started on {}", local_addr);

    let store = RedisStore::default();
    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Redis, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), store.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, store: RedisStore)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    loop {
        let args = match read_command(&mut reader).await {
            Some(args) if !args.is_empty() => args,
            _ => break,
        };

        reporter.spawn_update(&session, format!("&&{}", args.join(" ")));
        let reply = execute(&args, &store).await;

        if let Err(e) = writer.write_all(&reply).await {
            debug!("REDIS write error to {}: {}", session.remote_ip(), e);
            break;
        }
    }
    debug!("REDIS session closed for {}", session.remote_ip());
}

async fn execute(args: &[String], store: &RedisStore) -> Vec<u8> {
    match args[0].to_ascii_uppercase().as_str() {
        "SET" if args.len() >= 3 => {
            store.lock().await.insert(args[1].clone(), args[2].clone());
            b"+OK\r\n".to_vec()
        }
        "GET" if args.len() >= 2 => {
            let value = store.lock().await.get(&args[1]).cloned().unwrap_or_default();
            format!("${}\r\n{}\r\n", value.len(), value).into_bytes()
        }
        _ => b"+OK\r\n".to_vec(),
    }
}

/// Read one command as `*N` bulk strings or an inline line.
/// `None` on EOF, read errors, empty lines or malformed frames.
async fn read_command<R>(reader: &mut R) -> Option<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let line = read_line(reader).await?;
    if line.is_empty() {
        return None;
    }

    let Some(count) = line.strip_prefix('*') else {
        return Some(line.split_whitespace().map(String::from).collect());
    };

    let count: usize = count.parse().ok().filter(|n| *n <= MAX_ARGS)?;
    let mut args = Vec::with_capacity(count);
    for _ in 0..count {
        let header = read_line(reader).await?;
        let len: usize = header.strip_prefix('$')?.parse().ok().filter(|n| *n <= MAX_BULK)?;
        let mut buf = vec![0u8; len + 2];
        reader.read_exact(&mut buf).await.ok()?;
        if &buf[len..] != b"\r\n" {
            return None;
        }
        buf.truncate(len);
        args.push(String::from_utf8_lossy(&buf).into_owned());
    }
    Some(args)
}

async fn read_line<R>(reader: &mut R) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut raw = Vec::new();
    match (&mut *reader).take(64 * 1024).read_until(b'\n', &mut raw).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(String::from_utf8_lossy(&raw).trim_end_matches(['\r', '\n']).to_string()),
    }
}

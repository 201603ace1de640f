//! Telnet honeypot handler with IAC filtering

use anyhow::Result;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::acceptor::{accept_loop, ServiceTag};
use super::shell::{self, CommandTable, LineReader, ShellProfile, IAC, WILL};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session};

pub const DISPLAY_NAME: &str = "Telnet 23 decoy";

const SUPPRESS_GO_AHEAD: u8 = 3;

pub async fn start(addr: &str, ctx: Arc<HandlerContext>, extended: bool) -> Result<Listening> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("Telnet honeypot started on {}", local_addr);

    let profile = Arc::new(profile(&ctx, extended));
    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Telnet, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), profile.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub fn profile(ctx: &HandlerContext, extended: bool) -> ShellProfile {
    ShellProfile {
        banner: ctx.emulation.telnet_banner.clone(),
        prompt: ctx.emulation.telnet_prompt.clone(),
        commands: CommandTable::new(ctx.emulation.telnet_commands.clone()),
        login: extended,
    }
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, profile: Arc<ShellProfile>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (reader, mut writer) = tokio::io::split(stream);

    if let Err(e) = writer.write_all(&[IAC, WILL, SUPPRESS_GO_AHEAD]).await {
        debug!("Telnet negotiation failed for {}: {}", session.remote_ip(), e);
        return;
    }

    shell::run(LineReader::new(reader), writer, &session, &reporter, &profile).await;
    debug!("Telnet session ended from {}", session.remote_ip());
}

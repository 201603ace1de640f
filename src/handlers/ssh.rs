//! SSH honeypot handler
//!
//! A real SSH transport. Every password attempt is reported as a new record;
//! in extended mode the configured account gets a fake shell whose lines are
//! reported against the record of the successful login.

use anyhow::{anyhow, Result};
use rand::rngs::OsRng;
use russh::keys::{Algorithm, PrivateKey};
use russh::server::{self, Auth, Msg};
use russh::{Channel, ChannelId, CryptoVec, MethodKind, MethodSet, Pty, SshId};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info};

use super::acceptor::{accept_loop, ServiceTag};
use super::shell::{is_close_command, CommandTable, LineState};
use super::{HandlerContext, Listening};
use crate::pool::WorkerPool;
use crate::report::Reporter;
use crate::session::{ProtocolKind, Session, UNASSIGNED_ID};

pub const DISPLAY_NAME: &str = "SSH 22 decoy";

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared by every connection of one listener
pub struct SshSettings {
    server: Arc<server::Config>,
    prompt: String,
    commands: CommandTable,
    /// Accept the configured account instead of rejecting everyone
    extended: bool,
    account: String,
    password: String,
}

impl SshSettings {
    /// Fresh Ed25519 host key per listener
    pub fn new(ctx: &HandlerContext, extended: bool) -> Result<Self> {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .map_err(|e| anyhow!("SSH host key generation failed: {}", e))?;
        let server = server::Config {
            server_id: SshId::Standard(ctx.emulation.ssh_banner.clone()),
            methods: MethodSet::from(&[MethodKind::Password][..]),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: Some(IDLE_TIMEOUT),
            keys: vec![key],
            ..Default::default()
        };

        Ok(Self {
            server: Arc::new(server),
            prompt: ctx.emulation.ssh_hostname.clone(),
            commands: CommandTable::new(ctx.emulation.ssh_commands.clone()),
            extended,
            account: ctx.emulation.ssh_account.clone(),
            password: ctx.emulation.ssh_password.clone(),
        })
    }

    fn accepts(&self, user: &str, password: &str) -> bool {
        self.extended && user == self.account && password == self.password
    }
}

/// In extended mode the configured account logs in to the fake shell
pub async fn start(addr: &str, ctx: Arc<HandlerContext>, extended: bool) -> Result<Listening> {
    let settings = Arc::new(SshSettings::new(&ctx, extended)?);
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?.to_string();
    info!("SSH honeypot started on {}", local_addr);

    let reporter = ctx.reporter.clone();
    let pool = WorkerPool::new(ctx.pool_capacity);
    let task = tokio::spawn(accept_loop(
        listener,
        ServiceTag::new(ProtocolKind::Ssh, DISPLAY_NAME),
        pool.clone(),
        ctx.reporter.clone(),
        ctx.accept_delay,
        move |stream, session| handle(stream, session, reporter.clone(), settings.clone()),
    ));

    Ok(Listening::new(local_addr, task).with_pool(pool))
}

pub async fn handle<S>(stream: S, session: Session, reporter: Reporter, settings: Arc<SshSettings>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let ip = session.remote_ip().to_string();
    let handler = SshSession {
        session,
        reporter,
        settings: settings.clone(),
        line: LineState::default(),
    };

    let running = match server::run_stream(settings.server.clone(), stream, handler).await {
        Ok(running) => running,
        Err(e) => {
            debug!("SSH handshake with {} failed: {}", ip, e);
            return;
        }
    };
    if let Err(e) = running.await {
        debug!("SSH session from {} ended: {}", ip, e);
    }
}

struct SshSession {
    session: Session,
    reporter: Reporter,
    settings: Arc<SshSettings>,
    line: LineState,
}

impl SshSession {
    fn send(&self, channel: ChannelId, text: &str, ssh: &mut server::Session) -> Result<(), russh::Error> {
        ssh.data(channel, CryptoVec::from(text))
    }

    fn finish(&self, channel: ChannelId, ssh: &mut server::Session) -> Result<(), russh::Error> {
        ssh.exit_status_request(channel, 0)?;
        ssh.eof(channel)?;
        ssh.close(channel)
    }
}

impl server::Handler for SshSession {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let info = format!("{}&&{}", user, password);
        let id = self
            .reporter
            .report_result(ProtocolKind::Ssh, DISPLAY_NAME, self.session.remote_ip(), &info, UNASSIGNED_ID)
            .await;

        if !self.settings.accepts(user, password) {
            debug!("SSH login {} rejected from {}", user, self.session.remote_ip());
            return Ok(Auth::reject());
        }

        info!("SSH login {} accepted from {}", user, self.session.remote_ip());
        if id != UNASSIGNED_ID {
            self.session = Session::new(ProtocolKind::Ssh, DISPLAY_NAME, self.session.remote_addr.clone(), id);
        }
        Ok(Auth::Accept)
    }

    async fn channel_open_session(&mut self, _channel: Channel<Msg>, _session: &mut server::Session) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut server::Session,
    ) -> Result<(), Self::Error> {
        session.channel_success(channel)
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut server::Session) -> Result<(), Self::Error> {
        session.channel_success(channel)?;
        self.send(channel, &self.settings.prompt, session)
    }

    async fn exec_request(&mut self, channel: ChannelId, data: &[u8], session: &mut server::Session) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).trim().to_string();
        session.channel_success(channel)?;
        self.reporter.spawn_update(&self.session, format!("&&{}", command));

        let output = format!("{}\r\n", self.settings.commands.lookup(&command));
        self.send(channel, &output, session)?;
        self.finish(channel, session)
    }

    /// Raw-mode terminal input: echo each byte, answer each completed line
    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut server::Session) -> Result<(), Self::Error> {
        for &byte in data {
            let fx = self.line.feed(&[byte]);
            if !fx.echo.is_empty() {
                session.data(channel, CryptoVec::from(fx.echo))?;
            }

            let Some(line) = fx.lines.into_iter().next() else {
                if fx.interrupt || fx.to_shell.ends_with(b"\n") {
                    self.send(channel, &self.settings.prompt, session)?;
                }
                continue;
            };

            self.reporter.spawn_update(&self.session, format!("&&{}", line));
            if line == "exit" || is_close_command(&line) {
                debug!("SSH session closed by command from {}", self.session.remote_ip());
                return self.finish(channel, session);
            }
            let output = format!("{}\r\n{}", self.settings.commands.lookup(&line), self.settings.prompt);
            self.send(channel, &output, session)?;
        }
        Ok(())
    }
}

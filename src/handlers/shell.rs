//! Fake interactive shell shared by the SSH and Telnet decoys

use std::collections::HashMap;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::debug;

use crate::report::Reporter;
use crate::session::Session;

// Telnet command bytes
pub const IAC: u8 = 255; // Interpret As Command
pub const WILL: u8 = 251;
pub const WONT: u8 = 252;
pub const DO: u8 = 253;
pub const DONT: u8 = 254;
const SB: u8 = 250; // Subnegotiation Begin
const SE: u8 = 240; // Subnegotiation End

const CTRL_C: u8 = 0x03;
const BACKSPACE: u8 = 0x08;
const DELETE: u8 = 0x7f;

const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_LINE: usize = 4096;

/// Maps a command line to canned output
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    entries: HashMap<String, String>,
}

impl CommandTable {
    pub fn new(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Exact line first, then the bare command name, then `default`
    pub fn lookup(&self, line: &str) -> &str {
        let name = line.split_whitespace().next().unwrap_or_default();
        self.entries
            .get(line)
            .or_else(|| self.entries.get(name))
            .or_else(|| self.entries.get("default"))
            .map(String::as_str)
            .unwrap_or_default()
    }
}

/// Buffered line reader that strips telnet IAC sequences
pub struct LineReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
        }
    }

    async fn byte(&mut self) -> Option<u8> {
        self.inner.read_u8().await.ok()
    }

    /// Next non-empty line. `None` on EOF, error or idle timeout.
    pub async fn next_line(&mut self) -> Option<String> {
        tokio::time::timeout(IDLE_TIMEOUT, self.read_line()).await.ok().flatten()
    }

    async fn read_line(&mut self) -> Option<String> {
        let mut result = Vec::new();
        loop {
            let byte = self.byte().await?;

            if byte == IAC {
                match self.byte().await? {
                    // Escaped IAC (255 255) = literal 255
                    IAC => result.push(IAC),
                    WILL | WONT | DO | DONT => {
                        let option = self.byte().await?;
                        debug!("Telnet IAC negotiation option {}", option);
                    }
                    SB => self.skip_subnegotiation().await?,
                    _ => {}
                }
                continue;
            }

            match byte {
                b'\n' | b'\r' | 0 => {
                    // Skip empty lines caused by \r\n sequences
                    if result.is_empty() {
                        continue;
                    }
                    break;
                }
                0x08 | 0x7f => {
                    result.pop();
                }
                b if b >= 32 || b == b'\t' => {
                    if result.len() < MAX_LINE {
                        result.push(b);
                    }
                }
                _ => {}
            }
        }
        Some(String::from_utf8_lossy(&result).trim().to_string())
    }

    async fn skip_subnegotiation(&mut self) -> Option<()> {
        let mut in_iac = false;
        loop {
            let byte = self.byte().await?;
            if in_iac && byte == SE {
                return Some(());
            }
            in_iac = byte == IAC;
        }
    }
}

/// How a shell session presents itself
pub struct ShellProfile {
    pub banner: String,
    pub prompt: String,
    pub commands: CommandTable,
    /// Ask for credentials before the prompt
    pub login: bool,
}

/// `@close` and `@shutdown` end the attacker's own session
pub fn is_close_command(line: &str) -> bool {
    line.starts_with("@close") || line.starts_with("@shutdown")
}

/// Bytes produced by one chunk of raw terminal input
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InputEffects {
    pub echo: Vec<u8>,
    pub to_shell: Vec<u8>,
    pub lines: Vec<String>,
    pub interrupt: bool,
}

/// Line discipline for a raw-mode terminal: local echo, backspace, Ctrl-C
#[derive(Debug, Default)]
pub struct LineState {
    line: Vec<u8>,
    after_cr: bool,
}

impl LineState {
    pub fn feed(&mut self, input: &[u8]) -> InputEffects {
        let mut fx = InputEffects::default();
        for &b in input {
            let after_cr = std::mem::replace(&mut self.after_cr, false);
            match b {
                CTRL_C => {
                    fx.interrupt = true;
                    fx.echo.extend_from_slice(b"^C\r\n");
                    self.line.clear();
                }
                BACKSPACE | DELETE => {
                    fx.echo.extend_from_slice(b"\x08 \x08");
                    fx.to_shell.push(DELETE);
                    self.line.pop();
                }
                b'\n' if after_cr => {}
                b'\r' | b'\n' => {
                    self.after_cr = b == b'\r';
                    fx.echo.extend_from_slice(b"\r\n");
                    fx.to_shell.push(b'\n');
                    let line = String::from_utf8_lossy(&self.line).trim().to_string();
                    if !line.is_empty() {
                        fx.lines.push(line);
                    }
                    self.line.clear();
                }
                _ => {
                    fx.echo.push(b);
                    fx.to_shell.push(b);
                    self.line.push(b);
                }
            }
        }
        fx
    }
}

/// Run the prompt/command loop until the peer leaves or asks to close.
pub async fn run<R, W>(mut lines: LineReader<R>, writer: W, session: &Session, reporter: &Reporter, profile: &ShellProfile)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);
    let kind = session.kind;
    let ip = session.remote_ip().to_string();

    if send(&mut writer, &profile.banner).await.is_err() {
        debug!("{} write banner failed for {}", kind, ip);
        return;
    }

    if profile.login {
        if send(&mut writer, "login: ").await.is_err() {
            return;
        }
        let Some(user) = lines.next_line().await else { return };
        if send(&mut writer, "Password: ").await.is_err() {
            return;
        }
        let Some(password) = lines.next_line().await else { return };
        reporter.spawn_update(session, format!("{}&&{}", user, password));
        if send(&mut writer, "\r\n").await.is_err() {
            return;
        }
    }

    if send(&mut writer, &profile.prompt).await.is_err() {
        return;
    }

    while let Some(line) = lines.next_line().await {
        reporter.spawn_update(session, format!("&&{}", line));

        if is_close_command(&line) {
            debug!("{} session closed by command from {}", kind, ip);
            break;
        }

        let output = format!("{}\r\n{}", profile.commands.lookup(&line), profile.prompt);
        if send(&mut writer, &output).await.is_err() {
            debug!("{} write failed for {}", kind, ip);
            break;
        }
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut BufWriter<W>, text: &str) -> std::io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.flush().await
}

//! Raw stream relay behind `exec start`
//!
//! Once the 101 response is out the connection carries terminal bytes, not
//! HTTP. Input is echoed locally and fed to a real shell process; the shell's
//! output is written back with bare `\n` turned into `\r\n`.

use std::io;
use std::process::Stdio;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DockerConfig;
use crate::handlers::shell::LineState;
use crate::report::Reporter;
use crate::session::Session;

pub fn to_crlf(output: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(output.len() + output.len() / 8);
    for &b in output {
        if b == b'\n' {
            out.push(b'\r');
        }
        out.push(b);
    }
    out
}

/// Attach a shell to the upgraded connection until either side goes away
pub async fn run<R, W>(input: R, output: W, session: &Session, reporter: &Reporter, shell: &DockerConfig) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut child = Command::new(&shell.exec_shell)
        .args(&shell.exec_args)
        .env("TERM", "xterm")
        .env("HISTFILE", "/dev/null")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        return Err(io::Error::new(io::ErrorKind::BrokenPipe, "shell stdio not captured"));
    };
    let pid = child.id();
    debug!("Exec relay for {} attached to pid {:?}", session.remote_ip(), pid);

    let output = Mutex::new(output);
    tokio::select! {
        res = pump_input(input, stdin, &output, pid, session, reporter) => {
            if let Err(e) = res {
                debug!("Exec relay input from {} ended: {}", session.remote_ip(), e);
            }
        }
        _ = async { tokio::join!(pump_output(stdout, &output), pump_output(stderr, &output)) } => {}
    }

    let _ = child.start_kill();
    match child.wait().await {
        Ok(status) => debug!("Exec shell for {} exited: {}", session.remote_ip(), status),
        Err(e) => warn!("Exec shell reap failed on 127.0.0.1: {}", e),
    }
    Ok(())
}

async fn pump_input<R, W>(
    mut input: R,
    mut stdin: ChildStdin,
    output: &Mutex<W>,
    pid: Option<u32>,
    session: &Session,
    reporter: &Reporter,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut state = LineState::default();
    let mut buf = [0u8; 1024];
    loop {
        let n = input.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }

        let fx = state.feed(&buf[..n]);
        if fx.interrupt {
            interrupt(pid);
        }
        for line in fx.lines {
            reporter.spawn_update(session, format!("&&{}", line));
        }
        {
            let mut out = output.lock().await;
            out.write_all(&fx.echo).await?;
            out.flush().await?;
        }
        if !fx.to_shell.is_empty() {
            stdin.write_all(&fx.to_shell).await?;
            stdin.flush().await?;
        }
    }
}

async fn pump_output<O, W>(mut source: O, output: &Mutex<W>)
where
    O: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let mut out = output.lock().await;
        if out.write_all(&to_crlf(&buf[..n])).await.is_err() || out.flush().await.is_err() {
            return;
        }
    }
}

fn interrupt(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGINT) {
        debug!("SIGINT to exec shell {} failed: {}", pid, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::testing::recording_reporter;
    use crate::session::ProtocolKind;
    use tokio::io::duplex;

    #[test]
    fn output_newlines_become_crlf() {
        assert_eq!(to_crlf(b"a\nb\n"), b"a\r\nb\r\n");
    }

    #[tokio::test]
    async fn relays_a_real_shell() {
        let (reporter, recorded) = recording_reporter().await;
        let (mut client, server) = duplex(64 * 1024);
        let (input, output) = tokio::io::split(server);
        let session = Session::new(ProtocolKind::Docker, "Docker 2375 decoy", "192.0.2.8:5000", "12");
        let shell = DockerConfig {
            exec_shell: "/bin/sh".to_string(),
            exec_args: Vec::new(),
        };

        let relay = tokio::spawn(async move { run(input, output, &session, &reporter, &shell).await });

        client.write_all(b"echo $((40+2))\n").await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&seen).contains("42\r\n") {
            let n = client.read(&mut buf).await.unwrap();
            assert!(n > 0, "relay closed early");
            seen.extend_from_slice(&buf[..n]);
        }

        client.write_all(b"exit\n").await.unwrap();
        relay.await.unwrap().unwrap();

        let reports = recorded.wait_for(2).await;
        let mut infos: Vec<_> = reports.iter().map(|r| r["info"].as_str().unwrap().to_string()).collect();
        infos.sort();
        assert_eq!(infos, vec!["&&echo $((40+2))", "&&exit"]);
    }
}

use std::io::Write;
use std::process::ExitStatus;
use std::sync::Arc;

use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use futures::future::join;
use openssh::{Command as SSHCommand, KnownHosts, Session as SSHSession, SessionBuilder, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SshConfig;
use crate::error::InfraError;

/// Executes shell commands on one remote host.
#[async_trait]
pub trait Session: Send + Sync {
    /// Runs `command`, streaming its output. Fails on transport errors and on
    /// a non-zero exit status.
    async fn run(&self, command: &str) -> Result<(), InfraError>;

    /// Runs `command` and returns what it printed to stdout.
    async fn output(&self, command: &str) -> Result<String, InfraError>;

    /// Runs a check command. A non-zero exit is a legitimate `false`; only
    /// transport errors are errors.
    async fn probe(&self, command: &str) -> Result<bool, InfraError> {
        match self.run(command).await {
            Ok(()) => Ok(true),
            Err(InfraError::CommandFailed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Releases the connection, if one was opened.
    async fn close(&self) {}
}

/// `Session` over an OpenSSH multiplexed connection.
///
/// The connection is opened on first use, so building nodes never touches
/// the network.
pub struct SshSession {
    destination: String,
    user: String,
    config: SshConfig,
    label: ColoredString,
    session: Mutex<Option<Arc<SSHSession>>>,
}

impl SshSession {
    pub fn new(ip: &str, user: &str, config: SshConfig, label: ColoredString) -> Self {
        Self {
            destination: ip.to_string(),
            user: user.to_string(),
            config,
            label,
            session: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Arc<SSHSession>, InfraError> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(Arc::clone(session));
        }

        let mut builder = SessionBuilder::default();
        builder
            .user(self.user.clone())
            .port(self.config.port)
            .keyfile(&self.config.key_file)
            .known_hosts_check(KnownHosts::Add);
        match builder.connect_mux(&self.destination).await {
            Ok(session) => {
                debug!(host = %self.destination, user = %self.user, "connected");
                let session = Arc::new(session);
                *slot = Some(Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                warn!(host = %self.destination, error = %e, "failed to connect");
                Err(InfraError::Ssh(e))
            }
        }
    }

    /// Builds `sh -c <command>`, escalating with sudo for non-root users.
    fn command<'s>(&self, session: &'s SSHSession, command: &str) -> SSHCommand<'s> {
        if self.user == "root" {
            let mut cmd = session.command("sh");
            cmd.arg("-c").arg(command);
            cmd
        } else {
            let mut cmd = session.command("sudo");
            cmd.arg("sh").arg("-c").arg(command);
            cmd
        }
    }

    async fn stream<B: AsyncRead + Unpin>(&self, stream: B) -> std::io::Result<()> {
        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(reader.buffer().len());
        loop {
            read_until2(&mut reader, b'\r', b'\n', &mut buf).await?;
            // An empty buffer means that EOF was reached.
            if buf.is_empty() {
                return Ok(());
            }
            // Hold the lock for the whole line so output from concurrent
            // nodes does not interleave.
            let stdout = std::io::stdout();
            let mut guard = stdout.lock();
            let line = String::from_utf8_lossy(&buf);
            writeln!(
                guard,
                "{} {}",
                self.label,
                line.trim_end_matches(['\r', '\n'])
            )?;
            buf.clear();
        }
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&self, command: &str) -> Result<(), InfraError> {
        println!("{} === run '{}' ===", self.label, command);
        let session = self.connect().await?;
        let mut cmd = self.command(&session, command);
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut process = cmd.spawn().await?;
        if let (Some(stdout), Some(stderr)) = (process.stdout().take(), process.stderr().take()) {
            let (out, err) = join(self.stream(stdout), self.stream(stderr)).await;
            out?;
            err?;
        }
        let status = process.wait().await?;
        println!("{} === done ({}) ===", self.label, status);
        check_status(command, status)
    }

    async fn output(&self, command: &str) -> Result<String, InfraError> {
        let session = self.connect().await?;
        let mut cmd = self.command(&session, command);
        cmd.stdin(Stdio::null()).stderr(Stdio::inherit());
        let output = cmd.output().await?;
        check_status(command, output.status)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn probe(&self, command: &str) -> Result<bool, InfraError> {
        let session = self.connect().await?;
        let mut cmd = self.command(&session, command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let status = cmd.status().await?;
        debug!(host = %self.destination, command, %status, "probe finished");
        Ok(status.success())
    }

    async fn close(&self) {
        let session = match self.session.lock().await.take() {
            Some(session) => session,
            None => return,
        };
        match Arc::try_unwrap(session) {
            Ok(session) => {
                if let Err(e) = session.close().await {
                    warn!(host = %self.destination, error = %e, "error while terminating");
                }
            }
            Err(_) => warn!(host = %self.destination, "session still in use, dropping it"),
        }
    }
}

fn check_status(command: &str, status: ExitStatus) -> Result<(), InfraError> {
    if status.success() {
        Ok(())
    } else {
        Err(InfraError::CommandFailed {
            command: command.to_string(),
            status: status.to_string(),
        })
    }
}

/// Colored `[name@ip]` label prefixed to streamed output.
pub fn node_label(name: &str, ip: &str, master: bool) -> ColoredString {
    let label = format!("[{}@{}]", name, ip);
    if master {
        label.cyan().bold()
    } else {
        label.green()
    }
}

/// Reads into `buf` up to and including the first `delimiter1` or
/// `delimiter2`. Leaves `buf` empty at EOF.
async fn read_until2<B: AsyncRead + Unpin>(
    reader: &mut BufReader<B>,
    delimiter1: u8,
    delimiter2: u8,
    buf: &mut Vec<u8>,
) -> std::io::Result<()> {
    loop {
        let (done, used) = {
            let available = reader.fill_buf().await?;
            if let Some(i) = memchr::memchr2(delimiter1, delimiter2, available) {
                buf.extend_from_slice(&available[..=i]);
                (true, i + 1)
            } else {
                buf.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.consume(used);
        if done || used == 0 {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_until2_splits_on_either_delimiter() {
        let mut reader = BufReader::new(&b"downloading 10%\rdownloading 90%\ndone"[..]);
        let mut buf = Vec::new();

        read_until2(&mut reader, b'\r', b'\n', &mut buf).await.unwrap();
        assert_eq!(buf, b"downloading 10%\r");
        buf.clear();

        read_until2(&mut reader, b'\r', b'\n', &mut buf).await.unwrap();
        assert_eq!(buf, b"downloading 90%\n");
        buf.clear();

        read_until2(&mut reader, b'\r', b'\n', &mut buf).await.unwrap();
        assert_eq!(buf, b"done");
        buf.clear();

        read_until2(&mut reader, b'\r', b'\n', &mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[test]
    fn test_check_status() {
        use std::os::unix::process::ExitStatusExt;

        assert!(check_status("true", ExitStatus::from_raw(0)).is_ok());
        match check_status("false", ExitStatus::from_raw(1 << 8)) {
            Err(InfraError::CommandFailed { command, .. }) => assert_eq!(command, "false"),
            other => panic!("unexpected {:?}", other),
        }
    }
}

//! The Unix-domain control socket: `reload`, `retransfer <zone>`, and
//! `status [<zone>]`, framed the way `clientpipe.c` frames its interactive
//! session (a 3-octet header — 1-octet opcode, 2-octet big-endian length —
//! followed by payload).
//!
//! This module only speaks the wire protocol and command grammar; it holds
//! no zone state itself. A request is handed to whatever owns the zone
//! table over an `mpsc` channel and answered via a one-shot reply, the same
//! request/response shape used elsewhere for talking to a long-lived task.

use std::fmt;

use camino::Utf8Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

/// Mirrors `clientpipe.h`'s `enum msg_type`; only `Stdout`/`Stderr`/`Exit`
/// are ever sent by the daemon side, but all five are kept so the framing
/// matches that wire format exactly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ControlOpcode {
    Stdout = 0,
    Stderr = 1,
    Stdin = 2,
    Prompt = 3,
    Exit = 4,
}

impl TryFrom<u8> for ControlOpcode {
    type Error = ControlError;

    fn try_from(b: u8) -> Result<Self, Self::Error> {
        match b {
            0 => Ok(ControlOpcode::Stdout),
            1 => Ok(ControlOpcode::Stderr),
            2 => Ok(ControlOpcode::Stdin),
            3 => Ok(ControlOpcode::Prompt),
            4 => Ok(ControlOpcode::Exit),
            other => Err(ControlError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug)]
pub enum ControlError {
    Io(std::io::Error),
    UnknownOpcode(u8),
    UnknownCommand(String),
    MissingArgument(&'static str),
}

impl From<std::io::Error> for ControlError {
    fn from(e: std::io::Error) -> Self {
        ControlError::Io(e)
    }
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Io(e) => write!(f, "control socket I/O error: {e}"),
            ControlError::UnknownOpcode(b) => write!(f, "unknown control opcode {b}"),
            ControlError::UnknownCommand(cmd) => write!(f, "unknown command {cmd:?}"),
            ControlError::MissingArgument(name) => write!(f, "missing argument: {name}"),
        }
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ControlError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// A parsed line of input from a control client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    Reload,
    Retransfer(String),
    Status(Option<String>),
}

impl ControlCommand {
    pub fn parse(line: &str) -> Result<Self, ControlError> {
        let mut words = line.split_whitespace();
        match words.next() {
            Some("reload") => Ok(ControlCommand::Reload),
            Some("retransfer") => {
                let zone = words.next().ok_or(ControlError::MissingArgument("zone"))?;
                Ok(ControlCommand::Retransfer(zone.to_string()))
            }
            Some("status") => Ok(ControlCommand::Status(words.next().map(str::to_string))),
            Some(other) => Err(ControlError::UnknownCommand(other.to_string())),
            None => Err(ControlError::UnknownCommand(String::new())),
        }
    }
}

/// What the handler sends back: zero or more lines of text, then an exit
/// code mirroring `client_exit`'s single-octet payload.
#[derive(Clone, Debug, Default)]
pub struct ControlResponse {
    pub lines: Vec<String>,
    pub exit_code: u8,
}

impl ControlResponse {
    pub fn ok(lines: Vec<String>) -> Self {
        Self { lines, exit_code: 0 }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            lines: vec![message.into()],
            exit_code: 1,
        }
    }
}

/// One control request, handed off to whatever owns the zone table.
pub struct ControlRequest {
    pub command: ControlCommand,
    pub respond_to: oneshot::Sender<ControlResponse>,
}

async fn write_frame(
    stream: &mut UnixStream,
    opcode: ControlOpcode,
    payload: &[u8],
) -> Result<(), ControlError> {
    let mut header = [0u8; 3];
    header[0] = opcode as u8;
    header[1..3].copy_from_slice(&(payload.len() as u16).to_be_bytes());
    stream.write_all(&header).await?;
    stream.write_all(payload).await?;
    Ok(())
}

async fn read_frame(stream: &mut UnixStream) -> Result<(ControlOpcode, Vec<u8>), ControlError> {
    let mut header = [0u8; 3];
    stream.read_exact(&mut header).await?;
    let opcode = ControlOpcode::try_from(header[0])?;
    let len = u16::from_be_bytes([header[1], header[2]]) as usize;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok((opcode, payload))
}

/// Listens on a Unix-domain socket, reading one `Stdin`-framed command line
/// per connection and forwarding it to `requests` for handling, then
/// writing the reply back as `Stdout` lines followed by `Exit`.
pub struct ControlServer {
    listener: UnixListener,
    requests: mpsc::UnboundedSender<ControlRequest>,
}

impl ControlServer {
    pub fn bind(
        socket_path: &Utf8Path,
        requests: mpsc::UnboundedSender<ControlRequest>,
    ) -> Result<Self, ControlError> {
        let _ = std::fs::remove_file(socket_path);
        let listener = UnixListener::bind(socket_path.as_std_path())?;
        Ok(Self { listener, requests })
    }

    /// Accept connections until the socket is closed out from under us or
    /// the requests channel has no receiver left.
    pub async fn run(self) {
        loop {
            let Ok((stream, _addr)) = self.listener.accept().await else {
                return;
            };
            let requests = self.requests.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, requests).await {
                    tracing::warn!(error = %e, "control connection failed");
                }
            });
        }
    }

    async fn handle_connection(
        mut stream: UnixStream,
        requests: mpsc::UnboundedSender<ControlRequest>,
    ) -> Result<(), ControlError> {
        let (opcode, payload) = read_frame(&mut stream).await?;
        if opcode != ControlOpcode::Stdin {
            write_frame(&mut stream, ControlOpcode::Stderr, b"expected a command line\n").await?;
            write_frame(&mut stream, ControlOpcode::Exit, &[1]).await?;
            return Ok(());
        }
        let line = String::from_utf8_lossy(&payload);
        let response = match ControlCommand::parse(line.trim()) {
            Ok(command) => {
                let (tx, rx) = oneshot::channel();
                if requests.send(ControlRequest { command, respond_to: tx }).is_err() {
                    ControlResponse::error("daemon is shutting down")
                } else {
                    rx.await.unwrap_or_else(|_| ControlResponse::error("no reply from daemon"))
                }
            }
            Err(e) => ControlResponse::error(e.to_string()),
        };

        for line in &response.lines {
            let mut text = line.clone();
            text.push('\n');
            let opcode = if response.exit_code == 0 {
                ControlOpcode::Stdout
            } else {
                ControlOpcode::Stderr
            };
            write_frame(&mut stream, opcode, text.as_bytes()).await?;
        }
        write_frame(&mut stream, ControlOpcode::Exit, &[response.exit_code]).await?;
        Ok(())
    }
}

/// Send one command line to a running daemon's control socket and collect
/// its reply, the client half of the protocol `ControlServer` speaks.
pub async fn send_command(
    socket_path: &Utf8Path,
    command: &str,
) -> Result<ControlResponse, ControlError> {
    let mut stream = UnixStream::connect(socket_path.as_std_path()).await?;
    write_frame(&mut stream, ControlOpcode::Stdin, command.as_bytes()).await?;

    let mut lines = Vec::new();
    loop {
        let (opcode, payload) = read_frame(&mut stream).await?;
        match opcode {
            ControlOpcode::Stdout | ControlOpcode::Stderr => {
                lines.push(String::from_utf8_lossy(&payload).trim_end().to_string());
            }
            ControlOpcode::Exit => {
                let exit_code = payload.first().copied().unwrap_or(0);
                return Ok(ControlResponse { lines, exit_code });
            }
            ControlOpcode::Stdin | ControlOpcode::Prompt => {
                return Err(ControlError::UnknownCommand("unexpected reply opcode".to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reload() {
        assert_eq!(ControlCommand::parse("reload").unwrap(), ControlCommand::Reload);
    }

    #[test]
    fn parses_retransfer_with_zone() {
        assert_eq!(
            ControlCommand::parse("retransfer example.com").unwrap(),
            ControlCommand::Retransfer("example.com".to_string())
        );
    }

    #[test]
    fn retransfer_without_zone_is_an_error() {
        assert!(matches!(
            ControlCommand::parse("retransfer"),
            Err(ControlError::MissingArgument("zone"))
        ));
    }

    #[test]
    fn parses_status_with_and_without_zone() {
        assert_eq!(ControlCommand::parse("status").unwrap(), ControlCommand::Status(None));
        assert_eq!(
            ControlCommand::parse("status example.com").unwrap(),
            ControlCommand::Status(Some("example.com".to_string()))
        );
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            ControlCommand::parse("frobnicate"),
            Err(ControlError::UnknownCommand(_))
        ));
    }

    #[tokio::test]
    async fn round_trips_a_command_over_a_real_socket() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("ctl.sock")).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel::<ControlRequest>();
        let server = ControlServer::bind(&socket_path, tx).unwrap();
        tokio::spawn(server.run());

        tokio::spawn(async move {
            let req = rx.recv().await.unwrap();
            assert_eq!(req.command, ControlCommand::Status(None));
            let _ = req.respond_to.send(ControlResponse::ok(vec!["example.com: waiting".to_string()]));
        });

        let response = send_command(&socket_path, "status").await.unwrap();
        assert_eq!(response.exit_code, 0);
        assert_eq!(response.lines, vec!["example.com: waiting".to_string()]);
    }
}

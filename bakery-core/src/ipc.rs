//! Local channel between the main process and the elevated writer.
//!
//! One listener per write session: a Unix socket inside a private temp
//! directory, or a loopback TCP port where Unix sockets are unavailable.
//! Messages are newline-delimited JSON.

use bakery_error::{BakeryError, BakeryResult};
use serde::{Deserialize, Serialize};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::Duration;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WorkerMessage {
    WriteProgress { transferred: u64, length: u64 },
    WriteError { name: String, message: String },
    WriteDone { bytes_written: u64, sha256: String },
}

impl WorkerMessage {
    pub fn from_error(err: &BakeryError) -> Self {
        WorkerMessage::WriteError {
            name: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

fn ipc_err(context: &str, err: impl std::fmt::Display) -> BakeryError {
    BakeryError::Ipc(format!("{context}: {err}"))
}

enum Listener {
    #[cfg(unix)]
    Unix(UnixListener),
    Tcp(TcpListener),
}

enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

/// Something that can tell whether the peer process is gone.
pub trait Liveness {
    fn exited(&mut self) -> bool;
}

impl Liveness for std::process::Child {
    fn exited(&mut self) -> bool {
        !matches!(self.try_wait(), Ok(None))
    }
}

/// Listening end, owned by the main process.
pub struct WriterChannel {
    listener: Listener,
    address: String,
    // Keeps the socket directory alive for the session.
    _dir: Option<tempfile::TempDir>,
}

impl WriterChannel {
    pub fn create() -> BakeryResult<Self> {
        #[cfg(unix)]
        {
            let dir = tempfile::Builder::new()
                .prefix("bakery-ipc")
                .tempdir()
                .map_err(|e| ipc_err("cannot create socket directory", e))?;
            let path = dir.path().join("writer.sock");
            let listener =
                UnixListener::bind(&path).map_err(|e| ipc_err("cannot bind socket", e))?;
            Ok(Self {
                listener: Listener::Unix(listener),
                address: format!("unix:{}", path.display()),
                _dir: Some(dir),
            })
        }
        #[cfg(not(unix))]
        {
            Self::create_tcp()
        }
    }

    pub fn create_tcp() -> BakeryResult<Self> {
        let listener =
            TcpListener::bind(("127.0.0.1", 0)).map_err(|e| ipc_err("cannot bind port", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| ipc_err("cannot read bound port", e))?
            .port();
        Ok(Self {
            listener: Listener::Tcp(listener),
            address: format!("tcp:127.0.0.1:{port}"),
            _dir: None,
        })
    }

    /// Address handed to the worker on its command line.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Wait for the worker to connect, giving up once `peer` has exited.
    pub fn accept(self, peer: &mut dyn Liveness) -> BakeryResult<MessageReader> {
        let set_nonblocking = match &self.listener {
            #[cfg(unix)]
            Listener::Unix(l) => l.set_nonblocking(true),
            Listener::Tcp(l) => l.set_nonblocking(true),
        };
        set_nonblocking.map_err(|e| ipc_err("cannot poll socket", e))?;

        loop {
            let accepted = match &self.listener {
                #[cfg(unix)]
                Listener::Unix(l) => l.accept().and_then(|(s, _)| {
                    s.set_nonblocking(false)?;
                    Ok(Stream::Unix(s))
                }),
                Listener::Tcp(l) => l.accept().and_then(|(s, _)| {
                    s.set_nonblocking(false)?;
                    Ok(Stream::Tcp(s))
                }),
            };
            match accepted {
                Ok(stream) => {
                    return Ok(MessageReader {
                        reader: BufReader::new(stream),
                        _channel: self,
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if peer.exited() {
                        return Err(BakeryError::Elevation(
                            "the writer process exited before connecting".to_string(),
                        ));
                    }
                    std::thread::sleep(ACCEPT_POLL);
                }
                Err(err) => return Err(ipc_err("accept failed", err)),
            }
        }
    }
}

/// Receiving end of an accepted connection.
pub struct MessageReader {
    reader: BufReader<Stream>,
    _channel: WriterChannel,
}

impl MessageReader {
    /// Next message, `None` once the worker hangs up.
    pub fn recv(&mut self) -> BakeryResult<Option<WorkerMessage>> {
        let mut line = String::new();
        loop {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .map_err(|e| ipc_err("read failed", e))?;
            if read == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        serde_json::from_str(line.trim())
            .map(Some)
            .map_err(|e| ipc_err("malformed message", e))
    }
}

/// Sending end, used by the elevated worker.
pub struct MessageSender {
    stream: Stream,
}

impl MessageSender {
    pub fn connect(address: &str) -> BakeryResult<Self> {
        let stream = if let Some(addr) = address.strip_prefix("tcp:") {
            Stream::Tcp(TcpStream::connect(addr).map_err(|e| ipc_err("cannot connect", e))?)
        } else if let Some(path) = address.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                Stream::Unix(UnixStream::connect(path).map_err(|e| ipc_err("cannot connect", e))?)
            }
            #[cfg(not(unix))]
            {
                return Err(BakeryError::Ipc(format!(
                    "unix sockets are unavailable: {path}"
                )));
            }
        } else {
            return Err(BakeryError::Ipc(format!("unknown channel address '{address}'")));
        };
        Ok(Self { stream })
    }

    pub fn send(&mut self, message: &WorkerMessage) -> BakeryResult<()> {
        let mut line = serde_json::to_string(message).map_err(|e| ipc_err("encode failed", e))?;
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| ipc_err("send failed", e))
    }
}

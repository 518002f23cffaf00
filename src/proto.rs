//! The wire protocol shared by every component: a
//! synchronous request/response exchange over TCP. One request, one
//! reply, then the connection closes.
//!
//! Generic commands (`status`, `ping`, `register:...`, `dispatch:...`,
//! `runtest:...`) are small and arrive in a single `read()`, matching
//! the "single-read-then-close" formalization in the design notes.
//! `results` is length-framed: the declared byte length drives a loop
//! that keeps reading until the whole payload has arrived, so it
//! survives being split across TCP segments regardless of buffer size.

use std::fmt;
use std::net::SocketAddr;

use log::trace;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Read buffer chunk size, well above the 1 KiB floor, so small
/// commands and most result payloads land in a single `read()` call.
pub const READ_CHUNK: usize = 64 * 1024;

/// Maximum command length, excluding a `results` payload.
pub const MAX_COMMAND_LEN: usize = 64 * 1024;

/// Maximum `results` payload length.
pub const MAX_RESULT_PAYLOAD: usize = 16 * 1024 * 1024;

/// A parsed incoming request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// A plain `command` or `command:tail` request that isn't `results`.
    Simple { command: String, tail: Option<String> },
    /// A `results:<commit>:<length>:<payload>` request, fully accumulated.
    Results {
        commit: String,
        length: usize,
        payload: String,
    },
}

/// Why a request couldn't be parsed or accumulated off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The peer closed the connection before sending anything.
    EmptyRequest,
    /// A non-`results` command exceeded [`MAX_COMMAND_LEN`].
    CommandTooLong,
    /// `results` arrived with no tail at all (no `:` in the request).
    EmptyResultsArgument,
    /// `results:...` was missing the `<commit>:<length>:` prefix fields.
    MalformedResults,
    /// The declared length in a `results` request wasn't a valid integer.
    InvalidLength,
    /// The declared length exceeded [`MAX_RESULT_PAYLOAD`].
    ResultTooLarge,
    /// The connection closed before the declared payload length arrived.
    TruncatedResults,
    /// The bytes on the wire weren't valid UTF-8.
    InvalidEncoding,
    /// The underlying socket operation failed.
    Io(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::CommandTooLong => write!(f, "command exceeded maximum length"),
            Self::EmptyResultsArgument => write!(f, "Missing results data"),
            Self::MalformedResults => write!(f, "Invalid results format"),
            Self::InvalidLength => write!(f, "Invalid length in results"),
            Self::ResultTooLarge => write!(f, "Results payload too large"),
            Self::TruncatedResults => write!(f, "connection closed before full results payload arrived"),
            Self::InvalidEncoding => write!(f, "request was not valid UTF-8"),
            Self::Io(e) => write!(f, "I/O error reading request: {e}"),
        }
    }
}

impl std::error::Error for RequestError {}

impl From<std::io::Error> for RequestError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Split `raw` on the first `:`, giving a command token and an optional tail.
fn split_command(raw: &[u8]) -> Result<(&str, Option<&[u8]>), RequestError> {
    match raw.iter().position(|&b| b == b':') {
        Some(idx) => {
            let command = std::str::from_utf8(&raw[..idx]).map_err(|_| RequestError::InvalidEncoding)?;
            Ok((command, Some(&raw[idx + 1..])))
        }
        None => {
            let command = std::str::from_utf8(raw).map_err(|_| RequestError::InvalidEncoding)?;
            Ok((command, None))
        }
    }
}

/// Read one request off `stream`. Closes over the length-framing logic
/// for `results`; every other command is a single bounded read.
pub async fn read_request(stream: &mut TcpStream) -> Result<Request, RequestError> {
    let mut buf = vec![0u8; MAX_COMMAND_LEN + 1];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Err(RequestError::EmptyRequest);
    }
    buf.truncate(n);

    let (command, tail) = split_command(&buf)?;
    if command != "results" {
        if n > MAX_COMMAND_LEN {
            return Err(RequestError::CommandTooLong);
        }
        let tail = match tail {
            Some(bytes) => Some(std::str::from_utf8(bytes).map_err(|_| RequestError::InvalidEncoding)?.to_string()),
            None => None,
        };
        return Ok(Request::Simple {
            command: command.to_string(),
            tail,
        });
    }

    // results:<commit>:<length>:<payload...>
    let tail = tail.ok_or(RequestError::EmptyResultsArgument)?;
    let mut fields = tail.splitn(3, |&b| b == b':');
    let commit = fields.next().ok_or(RequestError::MalformedResults)?;
    let length_bytes = fields.next().ok_or(RequestError::MalformedResults)?;
    let payload_so_far = fields.next().unwrap_or(&[]);

    let commit = std::str::from_utf8(commit)
        .map_err(|_| RequestError::InvalidEncoding)?
        .to_string();
    let length_str = std::str::from_utf8(length_bytes).map_err(|_| RequestError::InvalidEncoding)?;
    let length: usize = length_str.parse().map_err(|_| RequestError::InvalidLength)?;
    if length > MAX_RESULT_PAYLOAD {
        return Err(RequestError::ResultTooLarge);
    }

    let mut payload = payload_so_far.to_vec();
    let mut chunk = vec![0u8; READ_CHUNK];
    while payload.len() < length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(RequestError::TruncatedResults);
        }
        payload.extend_from_slice(&chunk[..n]);
        trace!("accumulated {}/{} result bytes for {commit}", payload.len(), length);
    }
    payload.truncate(length);

    let payload = String::from_utf8(payload).map_err(|_| RequestError::InvalidEncoding)?;
    Ok(Request::Results {
        commit,
        length,
        payload,
    })
}

/// Write a reply and close the connection, per the one-request-one-reply
/// contract.
pub async fn write_reply(stream: &mut TcpStream, reply: &str) -> std::io::Result<()> {
    stream.write_all(reply.as_bytes()).await?;
    stream.shutdown().await
}

/// Resolves a `host:port` string to a socket address, re-resolving on
/// every call so a hostname like `localhost` doesn't have to be (and
/// can't always be) pinned to one address at CLI-parse time.
pub fn resolve(hostport: &str) -> std::io::Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    hostport.to_socket_addrs()?.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, format!("couldn't resolve {hostport}"))
    })
}

/// The client side of the transport primitive: open a
/// connection, send one message, read one reply, close.
pub async fn exchange(addr: SocketAddr, message: &str) -> std::io::Result<String> {
    let mut stream = TcpStream::connect(addr).await?;
    stream.write_all(message.as_bytes()).await?;
    stream.shutdown().await?;

    let mut reply = Vec::new();
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

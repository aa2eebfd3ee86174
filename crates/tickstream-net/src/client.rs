//! Resuming clients for both stream modes.
//!
//! A client keeps whatever it has received across dropped connections. On a
//! drop it waits out a [`ReconnectState`] backoff and reconnects, asking the
//! server to continue from where it left off. The stateful client finally
//! recomputes the checksum over everything it received and compares it with
//! the server's.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::checksum::{self, ChecksumError};
use crate::header::{self, StatefulParams, StatelessParams};
use crate::reconnection::{ReconnectConfig, ReconnectState};
use crate::store::SessionId;
use crate::stream::{CHECKSUM_PREFIX, EOF_MARKER};

/// Errors produced by the clients.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Every reconnection attempt failed.
    #[error("maximum reconnection attempts exhausted")]
    MaxRetriesExhausted,

    /// The server answered with an error line instead of a stream.
    #[error("server rejected request: {0}")]
    Rejected(String),

    /// The server sent something that does not fit the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The received values do not hash to the server's checksum.
    #[error("checksum mismatch: server sent {expected}, received values hash to {actual}")]
    ChecksumMismatch {
        /// Checksum announced by the server.
        expected: String,
        /// Checksum of the values actually received.
        actual: String,
    },

    /// Local socket configuration failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The local checksum could not be computed.
    #[error(transparent)]
    Checksum(#[from] ChecksumError),
}

/// One line of server output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    /// A streamed value.
    Value(u64),
    /// The final `checksum=<hex>` line.
    Checksum(String),
    /// End of stream.
    Eof,
    /// Anything else is error text.
    Error(String),
}

impl ServerLine {
    /// Classify a line (without its trailing newline).
    pub fn parse(line: &str) -> Self {
        if line == EOF_MARKER {
            return ServerLine::Eof;
        }
        if let Some(hex) = line.strip_prefix(CHECKSUM_PREFIX) {
            return ServerLine::Checksum(hex.to_string());
        }
        if !line.is_empty()
            && line.bytes().all(|b| b.is_ascii_digit())
            && let Ok(value) = line.parse()
        {
            return ServerLine::Value(value);
        }
        ServerLine::Error(line.to_string())
    }
}

/// Result of a finished stateful run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulRun {
    /// Every value received, in order.
    pub values: Vec<u32>,
    /// Checksum sent by the server.
    pub server_checksum: String,
    /// Checksum of `values` computed locally.
    pub local_checksum: String,
    /// Number of reconnections it took.
    pub reconnects: u32,
}

impl StatefulRun {
    /// Whether the local and server checksums agree.
    pub fn verified(&self) -> bool {
        self.server_checksum == self.local_checksum
    }

    /// [`verified`](Self::verified) as a `Result`.
    pub fn verify(&self) -> Result<(), ClientError> {
        if self.verified() {
            Ok(())
        } else {
            Err(ClientError::ChecksumMismatch {
                expected: self.server_checksum.clone(),
                actual: self.local_checksum.clone(),
            })
        }
    }
}

/// Result of a finished stateless run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatelessRun {
    /// Every value received, in order.
    pub values: Vec<u64>,
    /// Sum of `values`.
    pub sum: u128,
    /// Number of reconnections it took.
    pub reconnects: u32,
}

enum AttemptEnd {
    Finished,
    Dropped,
}

/// Stream a stateful session of `length` values under `id`, resuming across
/// dropped connections.
pub async fn run_stateful(
    addr: SocketAddr,
    id: SessionId,
    length: u32,
    reconnect: ReconnectConfig,
) -> Result<StatefulRun, ClientError> {
    let mut backoff = ReconnectState::new(reconnect);
    let mut values: Vec<u32> = Vec::with_capacity(length as usize);
    let mut server_checksum = None;
    let mut reconnects = 0;

    loop {
        let resume_from = u32::try_from(values.len())
            .map_err(|_| ClientError::Protocol("more values than requested".to_string()))?;
        let request = header::encode_stateful(&StatefulParams {
            id: id.clone(),
            length,
            resume_from,
        });

        let end = attempt(addr, &request, &mut backoff, |line| match line {
            ServerLine::Value(v) => {
                let v = u32::try_from(v)
                    .map_err(|_| ClientError::Protocol(format!("value {v} exceeds u32")))?;
                values.push(v);
                Ok(false)
            }
            ServerLine::Checksum(hex) => {
                server_checksum = Some(hex);
                Ok(false)
            }
            ServerLine::Eof => Ok(true),
            ServerLine::Error(text) => Err(ClientError::Rejected(text)),
        })
        .await?;

        match end {
            AttemptEnd::Finished => break,
            AttemptEnd::Dropped => {
                wait_to_reconnect(&mut backoff).await?;
                reconnects += 1;
                tracing::info!("Resuming session {id} at {}", values.len());
            }
        }
    }

    let server_checksum = server_checksum
        .ok_or_else(|| ClientError::Protocol("stream ended without a checksum".to_string()))?;
    let local_checksum = checksum::digest_values(&values)?.to_hex();

    tracing::info!(
        "Session {id} finished: {} values, checksum {}",
        values.len(),
        if server_checksum == local_checksum { "verified" } else { "MISMATCH" }
    );

    Ok(StatefulRun {
        values,
        server_checksum,
        local_checksum,
        reconnects,
    })
}

/// Stream `count` doubling values, resuming across dropped connections.
///
/// The first connection lets the server pick the initial value; later ones
/// send it back along with how many values are still missing.
pub async fn run_stateless(
    addr: SocketAddr,
    count: u32,
    reconnect: ReconnectConfig,
) -> Result<StatelessRun, ClientError> {
    let mut backoff = ReconnectState::new(reconnect);
    let mut values: Vec<u64> = Vec::with_capacity(count as usize);
    let mut initial = 0u32;
    let mut reconnects = 0;

    loop {
        let received = values.len() as u32;
        if received >= count {
            break;
        }
        let request = header::encode_stateless(&StatelessParams {
            initial,
            count: count - received,
            shift: received,
        });

        let end = attempt(addr, &request, &mut backoff, |line| match line {
            ServerLine::Value(v) => {
                if values.is_empty() {
                    initial = u32::try_from(v).map_err(|_| {
                        ClientError::Protocol(format!("initial value {v} out of range"))
                    })?;
                }
                values.push(v);
                Ok(false)
            }
            ServerLine::Eof => Ok(true),
            ServerLine::Checksum(_) => Err(ClientError::Protocol(
                "checksum on a stateless stream".to_string(),
            )),
            ServerLine::Error(text) => Err(ClientError::Rejected(text)),
        })
        .await?;

        match end {
            AttemptEnd::Finished => break,
            AttemptEnd::Dropped => {
                wait_to_reconnect(&mut backoff).await?;
                reconnects += 1;
            }
        }
    }

    let sum = values.iter().map(|&v| u128::from(v)).sum();
    tracing::info!("Stateless run finished: {} values, sum {sum}", values.len());
    Ok(StatelessRun {
        values,
        sum,
        reconnects,
    })
}

async fn wait_to_reconnect(backoff: &mut ReconnectState) -> Result<(), ClientError> {
    let delay = backoff
        .next_delay()
        .ok_or(ClientError::MaxRetriesExhausted)?;
    tracing::info!(
        "Reconnection attempt {} in {:?} ({} left)",
        backoff.attempts(),
        delay,
        backoff.remaining()
    );
    tokio::time::sleep(delay).await;
    Ok(())
}

/// One connection: send `request`, feed each line to `on_line` until it
/// reports end of stream. Connection failures are reported as
/// [`AttemptEnd::Dropped`]; errors from `on_line` end the run.
async fn attempt<F>(
    addr: SocketAddr,
    request: &str,
    backoff: &mut ReconnectState,
    mut on_line: F,
) -> Result<AttemptEnd, ClientError>
where
    F: FnMut(ServerLine) -> Result<bool, ClientError>,
{
    let mut stream = match TcpStream::connect(addr).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!("Connect to {addr} failed: {e}");
            return Ok(AttemptEnd::Dropped);
        }
    };
    stream.set_nodelay(true)?;
    backoff.reset();

    if let Err(e) = stream.write_all(request.as_bytes()).await {
        tracing::warn!("Sending request failed: {e}");
        return Ok(AttemptEnd::Dropped);
    }

    let mut reader = BufReader::new(stream);
    let mut buf = String::new();
    loop {
        buf.clear();
        match reader.read_line(&mut buf).await {
            Ok(0) => {
                tracing::warn!("Connection closed before EOF");
                return Ok(AttemptEnd::Dropped);
            }
            Ok(_) => {
                // A line without its newline was cut off by the disconnect.
                let Some(line) = buf.strip_suffix('\n') else {
                    tracing::warn!("Connection closed mid-line; discarding {buf:?}");
                    return Ok(AttemptEnd::Dropped);
                };
                let line = line.strip_suffix('\r').unwrap_or(line);
                tracing::debug!("Received {line}");
                if on_line(ServerLine::parse(line))? {
                    return Ok(AttemptEnd::Finished);
                }
            }
            Err(e) => {
                tracing::warn!("Read failed: {e}");
                return Ok(AttemptEnd::Dropped);
            }
        }
    }
}

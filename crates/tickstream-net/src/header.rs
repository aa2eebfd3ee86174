//! Fixed-width connection header.
//!
//! Every connection opens with a single mode byte followed by a mode-specific
//! body. There is no length prefix; all fields are fixed-width ASCII:
//!
//! ```text
//! stateful:  | 'Y' | session id (36) | n (5) | m (5) |
//! stateless: | 'N' | a (3)          | n (5) | m (5) |
//! ```
//!
//! Decimal fields are zero-padded. `n` is the sequence length, `m` the resume
//! offset (stateful) or doubling shift (stateless), `a` the initial value.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::store::SessionId;

/// Mode byte selecting the stateful (resumable) stream.
pub const MODE_STATEFUL: u8 = b'Y';
/// Mode byte selecting the stateless doubling stream.
pub const MODE_STATELESS: u8 = b'N';

/// Width of the textual session identifier.
pub const ID_LEN: usize = 36;
const COUNT_WIDTH: usize = 5;
const INITIAL_WIDTH: usize = 3;

/// Byte length of the stateful body (after the mode byte).
pub const STATEFUL_BODY_LEN: usize = ID_LEN + 2 * COUNT_WIDTH;
/// Byte length of the stateless body (after the mode byte).
pub const STATELESS_BODY_LEN: usize = INITIAL_WIDTH + 2 * COUNT_WIDTH;

/// Largest sequence length a client may request.
pub const MAX_LENGTH: u32 = 0xffff;
/// Largest explicit stateless initial value.
pub const MAX_INITIAL: u32 = 0xff;

/// Which stream the client asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Resumable, session-backed stream.
    Stateful,
    /// Doubling stream with no server-side state.
    Stateless,
}

impl Mode {
    /// Decode the leading mode byte.
    pub fn from_byte(byte: u8) -> Result<Self, HeaderError> {
        match byte {
            MODE_STATEFUL => Ok(Mode::Stateful),
            MODE_STATELESS => Ok(Mode::Stateless),
            other => Err(HeaderError::UnknownMode(other)),
        }
    }

    /// The wire byte for this mode.
    pub fn as_byte(self) -> u8 {
        match self {
            Mode::Stateful => MODE_STATEFUL,
            Mode::Stateless => MODE_STATELESS,
        }
    }
}

/// Parameters of a stateful request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatefulParams {
    /// Client-chosen session identifier.
    pub id: SessionId,
    /// Total number of values in the session's sequence (`n`).
    pub length: u32,
    /// Index of the first value the client still needs (`m`).
    pub resume_from: u32,
}

/// Parameters of a stateless request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatelessParams {
    /// Initial value `a`; zero asks the server to pick one.
    pub initial: u32,
    /// Number of values to emit (`n`).
    pub count: u32,
    /// Number of doublings already consumed (`m`).
    pub shift: u32,
}

/// A fully parsed connection header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Header {
    Stateful(StatefulParams),
    Stateless(StatelessParams),
}

/// Errors produced while reading or validating a header.
#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    /// The mode byte was neither `Y` nor `N`.
    #[error("unknown mode byte {0:#04x}")]
    UnknownMode(u8),

    /// A body slice had the wrong size.
    #[error("header body is {actual} bytes, expected {expected}")]
    Truncated {
        /// Required body length.
        expected: usize,
        /// Length actually supplied.
        actual: usize,
    },

    /// A numeric field contained something other than ASCII digits.
    #[error("field `{field}` is not a zero-padded decimal")]
    InvalidNumber {
        /// Field name.
        field: &'static str,
    },

    /// The session identifier was not printable ASCII.
    #[error("session identifier is not printable ASCII")]
    InvalidIdentifier,

    /// A numeric field parsed but fell outside its allowed range.
    #[error("{field} out of range: {value} (expected {min}..={max})")]
    ParameterOutOfRange {
        /// Field name.
        field: &'static str,
        /// Parsed value.
        value: u64,
        /// Inclusive lower bound.
        min: u64,
        /// Inclusive upper bound.
        max: u64,
    },

    /// The peer closed the connection before the header was complete.
    #[error("connection closed before header was complete")]
    ConnectionClosed,

    /// The header did not arrive within the I/O deadline.
    #[error("timed out waiting for header")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Slice parsers
// ---------------------------------------------------------------------------

/// Parse and validate a stateful body (everything after the mode byte).
pub fn parse_stateful(body: &[u8]) -> Result<StatefulParams, HeaderError> {
    expect_len(body, STATEFUL_BODY_LEN)?;

    let (id_bytes, rest) = body.split_at(ID_LEN);
    let (n_bytes, m_bytes) = rest.split_at(COUNT_WIDTH);

    if !id_bytes.iter().all(u8::is_ascii_graphic) {
        return Err(HeaderError::InvalidIdentifier);
    }
    let id = std::str::from_utf8(id_bytes).map_err(|_| HeaderError::InvalidIdentifier)?;

    let length = parse_decimal("n", n_bytes)?;
    check_range("n", length, 1, MAX_LENGTH)?;

    let resume_from = parse_decimal("m", m_bytes)?;
    check_range("m", resume_from, 0, length)?;

    Ok(StatefulParams {
        id: SessionId::new(id),
        length,
        resume_from,
    })
}

/// Parse and validate a stateless body (everything after the mode byte).
pub fn parse_stateless(body: &[u8]) -> Result<StatelessParams, HeaderError> {
    expect_len(body, STATELESS_BODY_LEN)?;

    let (a_bytes, rest) = body.split_at(INITIAL_WIDTH);
    let (n_bytes, m_bytes) = rest.split_at(COUNT_WIDTH);

    let initial = parse_decimal("a", a_bytes)?;
    check_range("a", initial, 0, MAX_INITIAL)?;

    let count = parse_decimal("n", n_bytes)?;
    check_range("n", count, 1, MAX_LENGTH)?;

    let shift = parse_decimal("m", m_bytes)?;
    check_range("m", shift, 0, MAX_LENGTH)?;

    Ok(StatelessParams {
        initial,
        count,
        shift,
    })
}

fn expect_len(body: &[u8], expected: usize) -> Result<(), HeaderError> {
    if body.len() != expected {
        return Err(HeaderError::Truncated {
            expected,
            actual: body.len(),
        });
    }
    Ok(())
}

fn parse_decimal(field: &'static str, digits: &[u8]) -> Result<u32, HeaderError> {
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return Err(HeaderError::InvalidNumber { field });
    }
    // At most five digits, so this cannot overflow.
    Ok(digits
        .iter()
        .fold(0u32, |acc, d| acc * 10 + u32::from(d - b'0')))
}

fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), HeaderError> {
    if value < min || value > max {
        return Err(HeaderError::ParameterOutOfRange {
            field,
            value: value.into(),
            min: min.into(),
            max: max.into(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Async readers
// ---------------------------------------------------------------------------

/// Read the mode byte.
pub async fn read_mode<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Mode, HeaderError> {
    let mut byte = [0u8; 1];
    read_exact_or_closed(reader, &mut byte).await?;
    Mode::from_byte(byte[0])
}

/// Read and validate a stateful body.
pub async fn read_stateful_params<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StatefulParams, HeaderError> {
    let mut body = [0u8; STATEFUL_BODY_LEN];
    read_exact_or_closed(reader, &mut body).await?;
    parse_stateful(&body)
}

/// Read and validate a stateless body.
pub async fn read_stateless_params<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<StatelessParams, HeaderError> {
    let mut body = [0u8; STATELESS_BODY_LEN];
    read_exact_or_closed(reader, &mut body).await?;
    parse_stateless(&body)
}

/// Read a complete header, failing with [`HeaderError::Timeout`] if it does
/// not arrive within `deadline`.
pub async fn read_header<R: AsyncRead + Unpin>(
    reader: &mut R,
    deadline: Duration,
) -> Result<Header, HeaderError> {
    let read = async {
        match read_mode(reader).await? {
            Mode::Stateful => read_stateful_params(reader).await.map(Header::Stateful),
            Mode::Stateless => read_stateless_params(reader).await.map(Header::Stateless),
        }
    };
    tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| HeaderError::Timeout)?
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), HeaderError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(HeaderError::ConnectionClosed)
        }
        Err(e) => Err(HeaderError::Io(e)),
    }
}

// ---------------------------------------------------------------------------
// Encoders
// ---------------------------------------------------------------------------

/// Encode a stateful header, mode byte included.
pub fn encode_stateful(params: &StatefulParams) -> String {
    format!(
        "{}{}{:05}{:05}",
        MODE_STATEFUL as char, params.id, params.length, params.resume_from
    )
}

/// Encode a stateless header, mode byte included.
pub fn encode_stateless(params: &StatelessParams) -> String {
    format!(
        "{}{:03}{:05}{:05}",
        MODE_STATELESS as char, params.initial, params.count, params.shift
    )
}

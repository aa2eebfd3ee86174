//! Stateless doubling stream.
//!
//! Given an initial value `a`, a count `n` and a shift `m`, emits
//! `a·2^m, a·2^(m+1), ...` for `n` values, one per tick, then `EOF`. Nothing
//! is stored: a reconnecting client resumes by sending back `a`, the number
//! of values still missing, and how many it already has as the shift.

use rand::Rng;
use tokio::io::AsyncWrite;

use crate::error::StreamError;
use crate::header::{HeaderError, MAX_INITIAL, StatelessParams};
use crate::stream::{self, EOF_MARKER, StreamSettings};

/// Summary of a completed stateless connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatelessOutcome {
    /// Initial value actually used (chosen by the server if the client sent 0).
    pub initial: u32,
    /// Values written.
    pub delivered: u32,
    /// Last value written.
    pub last: u64,
}

/// The values of a doubling stream, or an error if the last one would
/// overflow a `u64`.
pub fn doubling_values(
    initial: u32,
    count: u32,
    shift: u32,
) -> Result<impl Iterator<Item = u64>, HeaderError> {
    let initial = u64::from(initial);
    let highest_shift = u64::from(shift) + u64::from(count.saturating_sub(1));
    let headroom = u64::from(initial.leading_zeros());
    if initial != 0 && highest_shift > headroom {
        return Err(HeaderError::ParameterOutOfRange {
            field: "m",
            value: shift.into(),
            min: 0,
            max: headroom.saturating_sub(u64::from(count.saturating_sub(1))),
        });
    }
    Ok((0..count).map(move |i| initial.checked_shl(shift + i).unwrap_or(0)))
}

/// Serve one stateless connection whose header has already been parsed.
pub async fn handle_stateless<W: AsyncWrite + Unpin>(
    writer: &mut W,
    params: StatelessParams,
    settings: &StreamSettings,
) -> Result<StatelessOutcome, StreamError> {
    let initial = if params.initial == 0 {
        let chosen = rand::rng().random_range(1..=MAX_INITIAL);
        tracing::info!("Picked initial value {chosen} (n={})", params.count);
        chosen
    } else {
        params.initial
    };

    let values = match doubling_values(initial, params.count, params.shift) {
        Ok(values) => values,
        Err(e) => {
            let _ = stream::write_line(writer, &format!("error: {e}"), settings.io_deadline).await;
            return Err(e.into());
        }
    };

    let mut values = values.peekable();
    let mut delivered = 0u32;
    let mut last = 0u64;
    while let Some(value) = values.next() {
        stream::write_line(writer, &value.to_string(), settings.io_deadline).await?;
        tracing::trace!("Stateless stream sent {value}");
        delivered += 1;
        last = value;
        if values.peek().is_some() {
            tokio::time::sleep(settings.tick).await;
        }
    }
    stream::write_line(writer, EOF_MARKER, settings.io_deadline).await?;

    Ok(StatelessOutcome {
        initial,
        delivered,
        last,
    })
}

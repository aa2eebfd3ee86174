//! Line-oriented response stream shared by both connection modes.
//!
//! Values go out as newline-terminated decimals, one per tick. A stateful
//! stream ends with `checksum=<hex>` and then `EOF`; a stateless one with
//! `EOF` alone.

use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::error::StreamError;

/// End-of-stream marker line.
pub const EOF_MARKER: &str = "EOF";
/// Prefix of the checksum line.
pub const CHECKSUM_PREFIX: &str = "checksum=";

/// Timing for a streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSettings {
    /// Delay between consecutive values.
    pub tick: Duration,
    /// Sliding deadline applied to every read and write.
    pub io_deadline: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            io_deadline: Duration::from_secs(10),
        }
    }
}

/// Write one line and flush it, failing if that takes longer than `deadline`.
pub async fn write_line<W: AsyncWrite + Unpin>(
    writer: &mut W,
    line: &str,
    deadline: Duration,
) -> Result<(), StreamError> {
    let framed = format!("{line}\n");
    let write = async {
        writer.write_all(framed.as_bytes()).await?;
        writer.flush().await
    };
    tokio::time::timeout(deadline, write)
        .await
        .map_err(|_| StreamError::Timeout)??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_write_line_appends_newline() {
        let (mut server, mut client) = duplex(64);
        write_line(&mut server, "42", Duration::from_secs(1))
            .await
            .unwrap();
        drop(server);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "42\n");
    }

    #[tokio::test]
    async fn test_write_line_times_out_when_peer_stalls() {
        // Buffer smaller than the line and nobody reading.
        let (mut server, _client) = duplex(2);
        let result = write_line(&mut server, "123456789", Duration::from_millis(20)).await;
        assert!(matches!(result, Err(StreamError::Timeout)));
    }

    #[tokio::test]
    async fn test_write_line_fails_when_peer_gone() {
        let (mut server, client) = duplex(64);
        drop(client);
        let result = write_line(&mut server, "1", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
    }
}

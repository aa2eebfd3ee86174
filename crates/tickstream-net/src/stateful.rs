//! Resumable, session-backed stream.
//!
//! The handler creates the session on first contact, replays the sequence
//! from the offset the client declares, keeps the session alive while it
//! writes, and finishes with the checksum of the whole sequence.
//!
//! The client-declared offset is authoritative: a client may ask to replay
//! values it already has, or to skip ahead, and the handler serves exactly
//! what was asked. The store's own progress counter is bookkeeping only.

use tokio::io::AsyncWrite;

use crate::checksum::Checksum;
use crate::error::StreamError;
use crate::header::StatefulParams;
use crate::sequence;
use crate::store::{Removal, SessionId, SessionStore};
use crate::stream::{self, CHECKSUM_PREFIX, EOF_MARKER, StreamSettings};

/// Summary of a stateful connection that ran to completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatefulOutcome {
    /// Values written on this connection.
    pub delivered: u32,
    /// Checksum sent to the client.
    pub checksum: Checksum,
}

/// Serve one stateful connection whose header has already been parsed.
pub async fn handle_stateful<W: AsyncWrite + Unpin>(
    writer: &mut W,
    store: &SessionStore,
    params: StatefulParams,
    settings: &StreamSettings,
) -> Result<StatefulOutcome, StreamError> {
    let StatefulParams {
        id,
        length,
        resume_from,
    } = params;

    if !store.has(&id).await
        && let Err(e) = store.create(id.clone(), length, Some(resume_from)).await
    {
        tracing::warn!("Rejecting session {id}: {e}");
        // Best effort; the connection closes either way.
        let _ = stream::write_line(writer, &e.to_string(), settings.io_deadline).await;
        return Err(e.into());
    }

    let Some(session) = store.get(&id).await else {
        return Err(report_eviction(writer, id, settings).await);
    };
    if session.length != length {
        tracing::debug!(
            "Session {id} keeps its original length {} (client declared {length})",
            session.length
        );
    }
    if session.progress != resume_from {
        tracing::debug!(
            "Session {id} resuming at client offset {resume_from} (store progress {})",
            session.progress
        );
    }

    let seed = sequence::seed_for(&id);
    let mut values = sequence::generate_from(seed, session.length, resume_from).peekable();
    let mut delivered = 0u32;

    while let Some(value) = values.next() {
        // A failed write means the client is gone: stop without touching
        // the store so the session stays resumable until it idles out.
        stream::write_line(writer, &value.to_string(), settings.io_deadline).await?;
        store.advance(&id).await;
        store.touch(&id).await;
        delivered += 1;
        tracing::trace!("Session {id} sent {value}");

        if values.peek().is_some() {
            tokio::time::sleep(settings.tick).await;
            store.touch(&id).await;
        }
    }

    let Some(checksum) = store.checksum(&id).await? else {
        return Err(report_eviction(writer, id, settings).await);
    };
    store.cancel_timer(&id).await;
    store.remove(&id, Removal::Completed).await;

    tracing::info!("Session {id} complete; sending checksum {checksum}");
    stream::write_line(
        writer,
        &format!("{CHECKSUM_PREFIX}{checksum}"),
        settings.io_deadline,
    )
    .await?;
    stream::write_line(writer, EOF_MARKER, settings.io_deadline).await?;

    Ok(StatefulOutcome {
        delivered,
        checksum,
    })
}

/// Tell the client its session was evicted underneath this connection.
async fn report_eviction<W: AsyncWrite + Unpin>(
    writer: &mut W,
    id: SessionId,
    settings: &StreamSettings,
) -> StreamError {
    tracing::warn!("Session {id} was evicted while a connection was serving it");
    // Best effort; the connection closes either way.
    let message = format!("session {id} expired");
    let _ = stream::write_line(writer, &message, settings.io_deadline).await;
    StreamError::EvictionRace(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, duplex};

    use crate::checksum;
    use crate::store::StoreError;

    const ID: &str = "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa";

    fn fast() -> StreamSettings {
        StreamSettings {
            tick: Duration::from_millis(1),
            io_deadline: Duration::from_secs(1),
        }
    }

    fn params(length: u32, resume_from: u32) -> StatefulParams {
        StatefulParams {
            id: SessionId::new(ID),
            length,
            resume_from,
        }
    }

    /// Run the handler against an in-memory pipe and return what the client saw.
    async fn run(
        store: &SessionStore,
        params: StatefulParams,
    ) -> (Result<StatefulOutcome, StreamError>, Vec<String>) {
        let (mut server, mut client) = duplex(1 << 16);
        let result = handle_stateful(&mut server, store, params, &fast()).await;
        drop(server);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        (result, out.lines().map(str::to_owned).collect())
    }

    fn expected_values(length: u32, from: u32) -> Vec<String> {
        let seed = sequence::seed_for(&SessionId::new(ID));
        sequence::generate_from(seed, length, from)
            .map(|v| v.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_full_stream_then_checksum_then_eof() {
        let store = SessionStore::new(Duration::from_secs(30));
        let (result, lines) = run(&store, params(3, 0)).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.delivered, 3);
        assert_eq!(lines.len(), 5);
        assert_eq!(lines[..3], expected_values(3, 0)[..]);

        let hex = lines[3].strip_prefix("checksum=").unwrap();
        assert_eq!(hex.len(), 32);
        assert_eq!(hex, outcome.checksum.to_hex());
        assert_eq!(lines[4], "EOF");
    }

    #[tokio::test]
    async fn test_completion_removes_without_retiring() {
        let store = SessionStore::new(Duration::from_secs(30));
        let id = SessionId::new(ID);
        run(&store, params(3, 0)).await.0.unwrap();

        assert!(!store.has(&id).await);
        assert!(!store.is_retired(&id).await);

        // Same id again is a fresh session.
        let (result, lines) = run(&store, params(3, 0)).await;
        assert!(result.is_ok());
        assert_eq!(lines.len(), 5);
    }

    #[tokio::test]
    async fn test_resume_at_end_sends_only_checksum() {
        let store = SessionStore::new(Duration::from_secs(30));
        let (result, lines) = run(&store, params(1, 1)).await;

        let outcome = result.unwrap();
        assert_eq!(outcome.delivered, 0);
        let seed = sequence::seed_for(&SessionId::new(ID));
        let full = checksum::checksum(seed, 1).unwrap();
        assert_eq!(lines, vec![format!("checksum={full}"), "EOF".to_string()]);
    }

    #[tokio::test]
    async fn test_resume_mid_sequence_yields_tail_and_same_checksum() {
        let store = SessionStore::new(Duration::from_secs(30));
        let (first, _) = run(&store, params(6, 0)).await;

        let (second, lines) = run(&store, params(6, 4)).await;
        assert_eq!(lines[..2], expected_values(6, 4)[..]);
        assert_eq!(first.unwrap().checksum, second.unwrap().checksum);
    }

    #[tokio::test]
    async fn test_existing_session_attached_with_client_offset() {
        let store = SessionStore::new(Duration::from_secs(30));
        let id = SessionId::new(ID);
        // Store believes 4 values went out; the client asks for 2 onwards.
        store.create(id.clone(), 5, Some(4)).await.unwrap();

        let (result, lines) = run(&store, params(5, 2)).await;
        assert_eq!(result.unwrap().delivered, 3);
        assert_eq!(lines[..3], expected_values(5, 2)[..]);
    }

    #[tokio::test]
    async fn test_stored_length_wins_over_declared_length() {
        let store = SessionStore::new(Duration::from_secs(30));
        store.create(SessionId::new(ID), 2, None).await.unwrap();

        let (result, lines) = run(&store, params(9, 0)).await;
        assert_eq!(result.unwrap().delivered, 2);
        assert_eq!(lines.len(), 4);
    }

    #[tokio::test]
    async fn test_retired_identifier_gets_error_text() {
        let store = SessionStore::new(Duration::from_secs(30));
        let id = SessionId::new(ID);
        store.create(id.clone(), 3, None).await.unwrap();
        store.remove(&id, Removal::Expired).await;

        let (result, lines) = run(&store, params(3, 0)).await;
        assert!(matches!(
            result,
            Err(StreamError::Store(StoreError::IdentifierRetired(_)))
        ));
        assert_eq!(lines, vec![format!("client id {ID} went away and is reserved")]);
        assert!(!store.has(&id).await);
    }

    #[tokio::test]
    async fn test_client_gone_leaves_session_live() {
        let store = SessionStore::new(Duration::from_secs(30));
        let id = SessionId::new(ID);
        let (mut server, client) = duplex(1 << 16);
        drop(client);

        let result = handle_stateful(&mut server, &store, params(3, 0), &fast()).await;
        assert!(matches!(result, Err(StreamError::Transport(_))));
        assert!(result.unwrap_err().is_client_gone());

        let info = store.get(&id).await.expect("session must stay resumable");
        assert_eq!(info.progress, 0);
    }

    #[tokio::test]
    async fn test_eviction_mid_stream_is_reported() {
        // Every write touches the timer, so evict from outside between the
        // first and second value.
        let store = std::sync::Arc::new(SessionStore::new(Duration::from_secs(30)));
        let id = SessionId::new(ID);
        let (mut server, mut client) = duplex(1 << 16);
        let settings = StreamSettings {
            tick: Duration::from_millis(30),
            io_deadline: Duration::from_secs(1),
        };

        let evictor = {
            let store = std::sync::Arc::clone(&store);
            let id = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store.remove(&id, Removal::Expired).await;
            })
        };

        let result = handle_stateful(&mut server, &store, params(3, 0), &settings).await;
        evictor.await.unwrap();
        drop(server);

        assert!(matches!(result, Err(StreamError::EvictionRace(_))));
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        let lines: Vec<&str> = out.lines().collect();
        // Values already in flight still reach the socket; no checksum does.
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], format!("session {ID} expired"));
        assert!(store.is_retired(&id).await);
    }

    #[tokio::test]
    async fn test_report_eviction_tells_client() {
        let (mut server, mut client) = duplex(1 << 10);
        let error = report_eviction(&mut server, SessionId::new(ID), &fast()).await;
        drop(server);

        assert!(matches!(error, StreamError::EvictionRace(ref id) if id.as_str() == ID));
        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, format!("session {ID} expired\n"));
    }
}

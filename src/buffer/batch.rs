//! Forwarding batches over a [`ConnectionManager`]

use base64::{engine::general_purpose::STANDARD, Engine};
use futures_util::future::BoxFuture;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{BatchError, BatchHandler, BufferedChunk};
use crate::connection::{ConnectionManager, Envelope};

pub const AUDIO_BATCH_ACTION: &str = "audio_batch";

/// `{action: "audio_batch", sessionId, data: {chunks: [{sequence, timestampMs, audio}]}}`
pub fn audio_batch_envelope(session_id: &str, chunks: &[BufferedChunk]) -> Envelope {
    let chunks: Vec<Value> = chunks
        .iter()
        .map(|c| {
            json!({
                "sequence": c.chunk.sequence,
                "timestampMs": c.chunk.timestamp_ms,
                "audio": STANDARD.encode(&c.chunk.data),
            })
        })
        .collect();

    Envelope::new(AUDIO_BATCH_ACTION)
        .with_session(session_id)
        .with_field("chunks", chunks)
}

/// Batch handler that sends each batch as one `audio_batch` message
///
/// While the connection is down batches go to the manager's outbound queue;
/// once it has given up they fail and stay buffered.
pub fn connection_batch_handler(
    manager: ConnectionManager,
    session_id: impl Into<String>,
) -> BatchHandler {
    let session_id: Arc<str> = Arc::from(session_id.into());
    Arc::new(
        move |chunks: Vec<BufferedChunk>| -> BoxFuture<'static, Result<(), BatchError>> {
            let manager = manager.clone();
            let envelope = audio_batch_envelope(&session_id, &chunks);
            Box::pin(async move { manager.send(envelope).await.map_err(BatchError::from) })
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AudioChunk;

    #[tokio::test]
    async fn test_batch_envelope_shape() {
        let chunks = vec![
            BufferedChunk::new(0, AudioChunk::from_samples(&[1, 2], 10)),
            BufferedChunk::new(1, AudioChunk::from_samples(&[3], 11)),
        ];
        let envelope = audio_batch_envelope("session-1", &chunks);

        assert_eq!(envelope.action, "audio_batch");
        assert_eq!(envelope.session_id.as_deref(), Some("session-1"));

        let wire = serde_json::to_value(&envelope).unwrap();
        let sent = wire["data"]["chunks"].as_array().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["sequence"], 10);
        assert!(sent[0]["timestampMs"].as_i64().unwrap() > 0);
        assert_eq!(sent[0]["audio"], STANDARD.encode([1u8, 0, 2, 0]));
        assert_eq!(sent[1]["audio"], STANDARD.encode([3u8, 0]));
        assert_eq!(wire["sessionId"], "session-1");
    }
}

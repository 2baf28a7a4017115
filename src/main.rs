//! voxbridge relay
//!
//! Reads raw PCM16 mono audio from stdin, batches it and streams it to the
//! configured gateway. Translation and transcript events are logged.
//!
//! ```text
//! arecord -f S16_LE -r 24000 -c 1 -t raw | voxbridge
//! ```

use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use voxbridge::config::{default_config_path, load_config};
use voxbridge::{connection_batch_handler, AudioChunk, ChunkBuffer, TransportContext};

/// 100ms of 24kHz PCM16
const CHUNK_BYTES: usize = 4_800;

/// How long to wait for queued messages to leave on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info,tungstenite=warn,rustls=warn"),
    )
    .init();

    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        log::debug!("Relay: rustls crypto provider already installed");
    }

    let config = match default_config_path() {
        Ok(path) => load_config(&path),
        Err(e) => {
            log::warn!("Relay: {}, using defaults", e);
            Default::default()
        }
    }
    .apply_env();

    if let Err(e) = config.validate() {
        log::error!("Relay: {}", e);
        std::process::exit(2);
    }

    let session_id = uuid::Uuid::new_v4().to_string();
    log::info!("Relay: session {} -> {}", session_id, config.url);

    let context = TransportContext::new(config);
    let connection = context.connection();

    for action in ["translation", "transcript"] {
        connection.add_event_listener(action, move |envelope| {
            log::info!(
                "Relay: {} {}",
                action,
                serde_json::Value::Object(envelope.data.clone())
            );
        });
    }

    let mut status = connection.subscribe_status();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let state = *status.borrow_and_update();
            log::info!("Relay: connection {}", state);
        }
    });

    let mut surfaced = context.errors().subscribe();
    tokio::spawn(async move {
        while let Ok(error) = surfaced.recv().await {
            log::error!(
                "Relay: {} ({})",
                error.user_message(),
                error.recovery_actions().join("; ")
            );
        }
    });

    let buffer = context.chunk_buffer(connection_batch_handler(
        connection.clone(),
        session_id.clone(),
    ));

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Relay: interrupted");
            ctrl_c.cancel();
        }
    });

    if let Err(e) = connection.connect().await {
        log::error!("Relay: initial connect failed: {}", e);
    }

    match relay_stdin(&buffer, &cancel).await {
        Ok(chunks) => log::info!("Relay: read {} chunk(s) from stdin", chunks),
        Err(e) => log::error!("Relay: stdin read failed: {}", e),
    }

    if !cancel.is_cancelled() {
        let delivered = buffer.flush_all().await;
        log::debug!("Relay: final flush delivered {} chunk(s)", delivered);
        wait_for_drain(&connection).await;
    }

    let stats = buffer.stats();
    log::info!(
        "Relay: {} chunk(s) delivered, {} evicted, {} rejected",
        stats.total_delivered,
        stats.total_evicted,
        stats.total_rejected
    );

    buffer.dispose();
    connection.dispose().await;
}

/// Feed stdin into the buffer until EOF or cancellation
async fn relay_stdin(buffer: &ChunkBuffer, cancel: &CancellationToken) -> std::io::Result<u64> {
    let mut stdin = tokio::io::stdin();
    let mut chunk = vec![0u8; CHUNK_BYTES];
    let mut filled = 0;
    let mut sequence = 0u64;

    loop {
        let read = tokio::select! {
            biased;

            _ = cancel.cancelled() => return Ok(sequence),
            read = stdin.read(&mut chunk[filled..]) => read?,
        };

        if read == 0 {
            // Trailing partial chunk, cut to whole samples
            let whole = filled - filled % 2;
            if whole > 0 {
                let _ = buffer.add_chunk(AudioChunk::new(chunk[..whole].to_vec(), sequence));
                sequence += 1;
            }
            return Ok(sequence);
        }

        filled += read;
        if filled == CHUNK_BYTES {
            // Errors already went to the error handler
            let _ = buffer.add_chunk(AudioChunk::new(chunk.clone(), sequence));
            sequence += 1;
            filled = 0;
        }
    }
}

async fn wait_for_drain(connection: &voxbridge::ConnectionManager) {
    let deadline = Instant::now() + DRAIN_TIMEOUT;
    while Instant::now() < deadline {
        let stats = connection.stats().await;
        if stats.queued_messages == 0 && stats.pending_requests == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    log::warn!("Relay: shutting down with messages still queued");
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{Sink, SinkResult};
use bt1bridge_lib::telemetry::TelemetryRecord;
use futures_util::SinkExt;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

/// Upper bound for the TCP connect and the WebSocket handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pushes every record as one JSON text message, on a fresh connection each time.
pub struct WebSocketSink {
    url: String,
}

impl WebSocketSink {
    pub fn new(url: String) -> Self {
        log::info!("Pushing records to {url}");
        Self { url }
    }

    async fn push(&self, record: &TelemetryRecord) -> Result<()> {
        let payload = serde_json::to_string(record)?;
        let (mut stream, _) = timeout(
            CONNECT_TIMEOUT,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Timed out connecting to {}", self.url))?
        .with_context(|| format!("Cannot connect to {}", self.url))?;
        stream
            .send(Message::Text(payload))
            .await
            .with_context(|| format!("Cannot send record to {}", self.url))?;
        if let Err(err) = stream.close(None).await {
            log::debug!("Closing {} failed: {err}", self.url);
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for WebSocketSink {
    fn name(&self) -> &str {
        "websocket"
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
        self.push(record).await.map_err(Into::into)
    }
}

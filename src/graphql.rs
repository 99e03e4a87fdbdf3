use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{Sink, SinkResult};
use bt1bridge_lib::rate_limit::RateLimiter;
use bt1bridge_lib::telemetry::{Field, TelemetryRecord};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::Mutex;

const LOG_BATTERY_STATUS: &str = "mutation LogBatteryStatus($data: BatteryStatusArgs!) {
  logBatteryStatus(data: $data) {
    id
  }
}";

/// Fields the backend's `BatteryStatusArgs` input type does not declare.
const UNSUPPORTED_FIELDS: [Field; 1] = [Field::PowerConsumptionTotal];

/// Uploads records to a GraphQL backend, at most one per upload interval.
pub struct GraphQlSink {
    client: reqwest::Client,
    url: String,
    limiter: Mutex<RateLimiter>,
}

impl GraphQlSink {
    pub fn new(url: String, upload_interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;
        log::info!("Uploading records to {url} every {upload_interval:?} at most");
        Ok(Self {
            client,
            url,
            limiter: Mutex::new(RateLimiter::new(upload_interval)),
        })
    }

    async fn upload(&self, record: &TelemetryRecord) -> Result<()> {
        {
            let mut limiter = self.limiter.lock().await;
            if !limiter.try_acquire() {
                log::debug!("Skipping upload, next one in {:?}", limiter.remaining());
                return Ok(());
            }
        }

        let body = mutation_body(record, chrono::Utc::now())?;
        let response: Value = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to post to {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Upload rejected by {}", self.url))?
            .json()
            .await
            .context("Invalid GraphQL response")?;
        check_response(&response)?;
        log::info!("Uploaded record to {}", self.url);
        Ok(())
    }
}

fn mutation_body(record: &TelemetryRecord, reading_time: chrono::DateTime<chrono::Utc>) -> Result<Value> {
    let mut battery_status = serde_json::to_value(record)?;
    if let Value::Object(map) = &mut battery_status {
        for field in UNSUPPORTED_FIELDS {
            map.remove(field.name());
        }
    }
    Ok(json!({
        "query": LOG_BATTERY_STATUS,
        "variables": {
            "data": {
                "batteryStatus": battery_status,
                "readingTime": reading_time.to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            }
        }
    }))
}

fn check_response(response: &Value) -> Result<()> {
    match response.get("errors").and_then(Value::as_array) {
        Some(errors) if !errors.is_empty() => {
            let messages: Vec<&str> = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect();
            bail!("GraphQL errors: {}", messages.join("; "))
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl Sink for GraphQlSink {
    fn name(&self) -> &str {
        "graphql"
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
        self.upload(record).await.map_err(Into::into)
    }
}

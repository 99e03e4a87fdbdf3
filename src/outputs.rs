use anyhow::{Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{Sink, SinkResult};
use bt1bridge_lib::protocol::WriteAck;
use bt1bridge_lib::telemetry::TelemetryRecord;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::commandline::MqttFormat;
use crate::{csv_log, graphql, mqtt, websocket};

/// Prints records to the standard output.
pub struct ConsoleSink;

#[async_trait]
impl Sink for ConsoleSink {
    fn name(&self) -> &str {
        "console"
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
        println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
        println!("{}", serde_json::to_string_pretty(record)?);
        println!("--------------------------");
        Ok(())
    }

    async fn on_write_result(&self, ack: &WriteAck) -> SinkResult {
        println!(
            "{}: register {:#06x} = {}",
            chrono::Local::now().to_rfc3339(),
            ack.register,
            ack.value
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SinkOptions {
    pub console: bool,
    pub mqtt_config: Option<String>,
    pub mqtt_format: MqttFormat,
    pub csv: Option<PathBuf>,
    pub websocket: Option<String>,
    pub graphql_url: Option<String>,
    pub upload_interval: Duration,
}

pub fn build_sinks(options: &SinkOptions) -> Result<Vec<Arc<dyn Sink>>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if options.console {
        sinks.push(Arc::new(ConsoleSink));
    }
    if let Some(config_file) = &options.mqtt_config {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        sinks.push(Arc::new(mqtt::MqttSink::new(
            publisher,
            options.mqtt_format.clone(),
        )));
    }
    if let Some(path) = &options.csv {
        sinks.push(Arc::new(csv_log::CsvLogSink::open(path)?));
    }
    if let Some(url) = &options.websocket {
        sinks.push(Arc::new(websocket::WebSocketSink::new(url.clone())));
    }
    if let Some(url) = &options.graphql_url {
        sinks.push(Arc::new(graphql::GraphQlSink::new(
            url.clone(),
            options.upload_interval,
        )?));
    }
    if sinks.is_empty() {
        warn!("No output selected, records are only logged");
    }
    Ok(sinks)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> SinkOptions {
        SinkOptions {
            console: false,
            mqtt_config: None,
            mqtt_format: MqttFormat::Json,
            csv: None,
            websocket: None,
            graphql_url: None,
            upload_interval: Duration::from_secs(300),
        }
    }

    #[tokio::test]
    async fn sinks_follow_options() {
        assert!(build_sinks(&options()).unwrap().is_empty());

        let dir = tempfile::tempdir().unwrap();
        let sinks = build_sinks(&SinkOptions {
            console: true,
            csv: Some(dir.path().join("log.csv")),
            websocket: Some("ws://127.0.0.1:9".into()),
            graphql_url: Some("http://127.0.0.1:9/graphql".into()),
            ..options()
        })
        .unwrap();
        let names: Vec<&str> = sinks.iter().map(|s| s.name()).collect();
        assert_eq!(names, ["console", "csv", "websocket", "graphql"]);
    }

    #[tokio::test]
    async fn missing_mqtt_config_is_fatal() {
        let result = build_sinks(&SinkOptions {
            mqtt_config: Some("/nonexistent/mqtt.yaml".into()),
            ..options()
        });
        assert!(result.is_err());
    }
}

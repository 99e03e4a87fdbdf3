use crate::commandline::MqttFormat;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{Sink, SinkResult};
use bt1bridge_lib::telemetry::TelemetryRecord;
use rumqttc::{AsyncClient, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use url::{Host, Url};

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    uri: String,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        with = "humantime_serde"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_topic() -> String {
        "bt1bridge".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("bt1bridge-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    fn qos(&self) -> QoS {
        match self.qos {
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            _ => QoS::AtMostOnce,
        }
    }

    fn options(&self) -> Result<MqttOptions> {
        let (host, port) = parse_broker_uri(&self.uri)?;
        let mut options = MqttOptions::new(&self.client_id, host, port);
        options.set_keep_alive(self.keep_alive_interval);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        Ok(options)
    }
}

/// Resolves a broker URI such as `tcp://host:port` to the host and port rumqttc connects to.
///
/// A bare `host:port` is read as `tcp://host:port`; the port defaults to 1883.
fn parse_broker_uri(uri: &str) -> Result<(String, u16)> {
    let broker_url = if uri.contains("://") {
        Url::parse(uri)
    } else {
        Url::parse(&format!("tcp://{uri}"))
    }
    .with_context(|| format!("Invalid MQTT broker URI '{uri}'"))?;

    let host = match broker_url.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => bail!("Missing host in MQTT broker URI '{uri}'"),
    };
    Ok((host, broker_url.port().unwrap_or(1883)))
}

pub struct MqttPublisher {
    client: AsyncClient,
    config: MqttConfig,
    event_loop: JoinHandle<()>,
}

impl MqttPublisher {
    /// Must be called from within a tokio runtime; the connection is driven by a background task.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let options = config.options()?;
        log::info!(
            "Attempting to connect to MQTT broker: {} with client_id: {}",
            config.uri,
            config.client_id
        );
        let (client, mut event_loop) = AsyncClient::new(options, 10);
        let reconnect_delay = config.reconnect_delay;
        let event_loop = tokio::spawn(async move {
            loop {
                match event_loop.poll().await {
                    Ok(event) => log::trace!("MQTT event: {event:?}"),
                    Err(err) => {
                        log::error!("MQTT connection error: {err}, retrying in {reconnect_delay:?}");
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        });
        Ok(Self {
            client,
            config,
            event_loop,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );
        self.client
            .publish(topic, self.config.qos(), false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic))
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.event_loop.abort();
    }
}

/// One JSON document per record, or one topic per field.
pub struct MqttSink {
    publisher: MqttPublisher,
    format: MqttFormat,
}

impl MqttSink {
    pub fn new(publisher: MqttPublisher, format: MqttFormat) -> Self {
        Self { publisher, format }
    }

    async fn publish_record(&self, record: &TelemetryRecord) -> Result<()> {
        match self.format {
            MqttFormat::Json => {
                let json_payload = serde_json::to_string(record)?;
                self.publisher
                    .publish(self.publisher.topic(), &json_payload)
                    .await
            }
            MqttFormat::Simple => {
                for (topic, payload) in simple_messages(self.publisher.topic(), record)? {
                    self.publisher.publish(&topic, &payload).await?;
                }
                Ok(())
            }
        }
    }
}

fn simple_messages(base_topic: &str, record: &TelemetryRecord) -> Result<Vec<(String, String)>> {
    let serde_json::Value::Object(map) = serde_json::to_value(record)? else {
        bail!("Telemetry record did not serialize to an object");
    };
    Ok(map
        .into_iter()
        .filter_map(|(key, value)| {
            let payload = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => return None,
                other => other.to_string(),
            };
            Some((format!("{base_topic}/{key}"), payload))
        })
        .collect())
}

#[async_trait]
impl Sink for MqttSink {
    fn name(&self) -> &str {
        "mqtt"
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
        self.publish_record(record).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bt1bridge_lib::telemetry::FieldMap;
    use std::io::Write;

    #[test]
    fn broker_uri_forms() {
        assert_eq!(
            parse_broker_uri("tcp://broker.local:1884").unwrap(),
            ("broker.local".to_string(), 1884)
        );
        assert_eq!(
            parse_broker_uri("mqtt://broker.local").unwrap(),
            ("broker.local".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_uri("10.0.0.2:1883").unwrap(),
            ("10.0.0.2".to_string(), 1883)
        );
        assert!(parse_broker_uri("tcp://broker:port").is_err());
        assert!(parse_broker_uri("tcp://:1883").is_err());
    }

    #[test]
    fn broker_uri_ipv6_and_userinfo() {
        assert_eq!(
            parse_broker_uri("tcp://[::1]:1883").unwrap(),
            ("::1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_uri("mqtt://[::1]").unwrap(),
            ("::1".to_string(), 1883)
        );
        assert_eq!(
            parse_broker_uri("tcp://user:pw@broker:1884").unwrap(),
            ("broker".to_string(), 1884)
        );
    }

    #[test]
    fn load_applies_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "uri: tcp://localhost:1883\nqos: 1\nreconnect_delay: 2s").unwrap();
        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.topic, "bt1bridge");
        assert_eq!(config.qos(), QoS::AtLeastOnce);
        assert_eq!(config.reconnect_delay, Duration::from_secs(2));
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert!(config.client_id.starts_with("bt1bridge-"));
        assert_eq!(config.client_id.len(), "bt1bridge-".len() + 8);
    }

    #[test]
    fn load_reports_missing_file() {
        assert!(MqttConfig::load("/nonexistent/mqtt.yaml").is_err());
    }

    #[test]
    fn simple_format_has_one_topic_per_field() {
        let record = FieldMap::default().decode(&[0u8; 68]).unwrap();
        let messages = simple_messages("solar", &record).unwrap();
        assert_eq!(messages.len(), 21);
        assert!(messages.contains(&("solar/load_status".to_string(), "off".to_string())));
        assert!(messages.contains(&(
            "solar/charging_status".to_string(),
            "deactivated".to_string()
        )));
        assert!(messages.contains(&("solar/battery_percentage".to_string(), "0.0".to_string())));
    }
}

use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;
#[cfg(feature = "ble")]
use std::time::Duration;

#[cfg(feature = "ble")]
#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq)]
pub enum LoadSwitch {
    On,
    Off,
}

#[cfg(feature = "ble")]
impl LoadSwitch {
    pub fn register_value(self) -> u16 {
        match self {
            LoadSwitch::On => 1,
            LoadSwitch::Off => 0,
        }
    }
}

#[cfg(feature = "ble")]
#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Decode a captured response frame given as hex and print it as JSON
    Decode {
        /// Frame bytes including the checksum, e.g. "ff06010a00017c2a"
        frame: String,
    },
    /// Print the read request frame for a register block as hex
    ReadRequest {
        /// First register to read
        #[arg(long, default_value_t = bt1bridge_lib::protocol::STATUS_REGISTER)]
        register: u16,
        /// Number of 16 bit words to read
        #[arg(long, default_value_t = u32::from(bt1bridge_lib::protocol::STATUS_WORDS))]
        words: u32,
    },
    /// Print the write request frame for a single register as hex
    WriteRequest {
        /// Register to write
        #[arg(long, default_value_t = bt1bridge_lib::protocol::LOAD_REGISTER)]
        register: u16,
        /// Value to write
        value: u32,
    },
    /// Run in daemon mode, periodically polling the controller and forwarding records
    #[cfg(feature = "ble")]
    Daemon {
        /// Interval between polls (e.g., "30s", "1m")
        #[arg(long, short, value_parser = humantime::parse_duration, default_value = "30s")]
        interval: Duration,
        /// Print every record to the standard output
        #[arg(long)]
        console: bool,
        /// The configuration file for the MQTT broker
        #[arg(long)]
        mqtt_config: Option<String>,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Json)]
        mqtt_format: MqttFormat,
        /// Append every record to this CSV file
        #[arg(long)]
        csv: Option<PathBuf>,
        /// Push every record as JSON to this WebSocket server
        #[arg(long, env = "SERVER_URI")]
        websocket: Option<String>,
        /// Upload records to this GraphQL endpoint
        #[arg(long, env = "BACKEND_URL")]
        graphql_url: Option<String>,
        /// Minimum time between two GraphQL uploads
        #[arg(long, value_parser = humantime::parse_duration, default_value = "5m")]
        upload_interval: Duration,
        /// Switch the load once on connect instead of polling
        #[arg(long, value_enum)]
        load_on_connect: Option<LoadSwitch>,
    },
    /// Switch the load output on or off and wait for the acknowledgement
    #[cfg(feature = "ble")]
    SetLoad {
        #[arg(value_enum)]
        state: LoadSwitch,
        /// How long to wait for the acknowledgement
        #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
        timeout: Duration,
    },
}

const fn about_text() -> &'static str {
    "renogy bt-1 charge controller bridge"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Modbus device id of the controller behind the BT-1 module
    #[arg(long, global = true, default_value_t = bt1bridge_lib::protocol::DEFAULT_DEVICE_ADDRESS)]
    pub device_id: u8,

    #[cfg(feature = "ble")]
    /// Bluetooth name of the BT-1 module (e.g., "BT-TH-309C6414")
    #[arg(long, global = true)]
    pub name: Option<String>,

    #[cfg(feature = "ble")]
    /// Bluetooth address of the BT-1 module (e.g., "DC:0D:30:9C:64:14")
    #[arg(long, global = true)]
    pub mac: Option<String>,

    #[cfg(feature = "ble")]
    /// How long to scan for the module before giving up
    #[arg(long, global = true, value_parser = humantime::parse_duration, default_value = "30s")]
    pub scan_timeout: Duration,

    /// YAML file replacing the built-in telemetry field table
    #[arg(long, global = true)]
    pub field_map: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decode_command() {
        let args = CliArgs::parse_from(["bt1bridge", "decode", "ff06010a00017c2a"]);
        assert_eq!(
            args.command,
            CliCommands::Decode {
                frame: "ff06010a00017c2a".into()
            }
        );
        assert_eq!(args.device_id, 0xff);
    }

    #[cfg(feature = "ble")]
    #[test]
    fn daemon_defaults() {
        let args = CliArgs::parse_from(["bt1bridge", "daemon", "--mac", "DC:0D:30:9C:64:14"]);
        assert_eq!(args.scan_timeout, Duration::from_secs(30));
        assert_eq!(args.mac.as_deref(), Some("DC:0D:30:9C:64:14"));
        match args.command {
            CliCommands::Daemon {
                interval,
                mqtt_format,
                load_on_connect,
                ..
            } => {
                assert_eq!(interval, Duration::from_secs(30));
                assert_eq!(mqtt_format, MqttFormat::Json);
                assert_eq!(load_on_connect, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn read_request_defaults_to_status_block() {
        let args = CliArgs::parse_from(["bt1bridge", "read-request", "--device-id", "1"]);
        assert_eq!(
            args.command,
            CliCommands::ReadRequest {
                register: 256,
                words: 34
            }
        );
        assert_eq!(args.device_id, 1);
    }

    #[test]
    fn write_request_defaults_to_load_register() {
        let args = CliArgs::parse_from(["bt1bridge", "write-request", "1"]);
        assert_eq!(
            args.command,
            CliCommands::WriteRequest {
                register: 266,
                value: 1
            }
        );
    }
}

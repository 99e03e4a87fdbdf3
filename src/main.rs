use anyhow::{Context, Result};
use bt1bridge_lib::protocol::{self, FrameDecoder, Response};
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

use commandline::{CliArgs, CliCommands};

#[cfg(feature = "ble")]
mod ble;
mod commandline;
mod config;
#[cfg(feature = "ble")]
mod csv_log;
#[cfg(feature = "ble")]
mod daemon;
#[cfg(feature = "ble")]
mod graphql;
#[cfg(feature = "ble")]
mod mqtt;
#[cfg(feature = "ble")]
mod outputs;
#[cfg(feature = "ble")]
mod reassembly;
#[cfg(feature = "ble")]
mod websocket;

fn logging_init(loglevel: LevelFilter) -> Result<LoggerHandle> {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .context("Cannot init logging")?
        .start()
        .context("Cannot start logging")?;

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    Ok(log_handle)
}

fn decode(decoder: &FrameDecoder, frame: &str) -> Result<String> {
    let bytes = hex::decode(frame.trim().replace([' ', ':'], ""))
        .with_context(|| format!("'{frame}' is not a hex string"))?;
    let response = decoder
        .parse(&bytes)
        .with_context(|| format!("Cannot decode frame {frame}"))?;
    let json = match response {
        Response::Telemetry(record) => serde_json::to_string_pretty(&record)?,
        Response::WriteAck(ack) => serde_json::to_string_pretty(&ack)?,
    };
    Ok(json)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter())?;

    let field_map = config::field_map_or_default(args.field_map.as_deref())?;
    let decoder = FrameDecoder::new(field_map);

    match args.command {
        CliCommands::Decode { frame } => println!("{}", decode(&decoder, &frame)?),
        CliCommands::ReadRequest { register, words } => {
            let request = protocol::build_read_request(args.device_id, register, words)
                .with_context(|| "Cannot build read request")?;
            println!("{}", hex::encode(request));
        }
        CliCommands::WriteRequest { register, value } => {
            let request = protocol::build_write_request(args.device_id, register, value)
                .with_context(|| "Cannot build write request")?;
            println!("{}", hex::encode(request));
        }
        #[cfg(feature = "ble")]
        CliCommands::Daemon {
            interval,
            console,
            mqtt_config,
            mqtt_format,
            csv,
            websocket,
            graphql_url,
            upload_interval,
            load_on_connect,
        } => {
            let sinks = outputs::build_sinks(&outputs::SinkOptions {
                console,
                mqtt_config,
                mqtt_format,
                csv,
                websocket,
                graphql_url,
                upload_interval,
            })?;
            let mut link =
                link_options(&args.name, &args.mac, args.scan_timeout, args.device_id, decoder);
            link.poll.interval = interval;
            daemon::run(link, sinks, load_on_connect).await?
        }
        #[cfg(feature = "ble")]
        CliCommands::SetLoad { state, timeout } => {
            let link =
                link_options(&args.name, &args.mac, args.scan_timeout, args.device_id, decoder);
            daemon::set_load(link, state, timeout).await?
        }
    }

    Ok(())
}

#[cfg(feature = "ble")]
fn link_options(
    name: &Option<String>,
    mac: &Option<String>,
    scan_timeout: std::time::Duration,
    device_id: u8,
    decoder: FrameDecoder,
) -> daemon::LinkOptions {
    daemon::LinkOptions {
        selector: ble::DeviceSelector {
            name: name.clone(),
            mac: mac.clone(),
        },
        scan_timeout,
        poll: bt1bridge_lib::dispatcher::PollConfig {
            device_address: device_id,
            ..Default::default()
        },
        decoder,
    }
}

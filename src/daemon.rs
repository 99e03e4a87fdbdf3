use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use bt1bridge_lib::dispatcher::{ConnectAction, Dispatcher, PollConfig, Sink, SinkResult};
use bt1bridge_lib::protocol::{FrameDecoder, WriteAck};
use bt1bridge_lib::telemetry::TelemetryRecord;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::ble::{BleLink, BleTransport, DeviceSelector};
use crate::commandline::LoadSwitch;
use crate::reassembly::{FrameAssembler, NOTIFICATION_GAP};

/// Where and how to reach the controller.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub selector: DeviceSelector,
    pub scan_timeout: Duration,
    pub poll: PollConfig,
    pub decoder: FrameDecoder,
}

fn dispatcher(
    link: &LinkOptions,
    transport: Arc<BleTransport>,
    sinks: Vec<Arc<dyn Sink>>,
    action: ConnectAction,
) -> Dispatcher<BleTransport> {
    sinks.into_iter().fold(
        Dispatcher::new(transport, link.poll.clone())
            .with_decoder(link.decoder.clone())
            .with_connect_action(action),
        Dispatcher::with_sink,
    )
}

/// Connects, polls until Ctrl-C or until the link drops, then disconnects.
pub async fn run(
    link: LinkOptions,
    sinks: Vec<Arc<dyn Sink>>,
    load_on_connect: Option<LoadSwitch>,
) -> Result<()> {
    let action = match load_on_connect {
        Some(state) => ConnectAction::SetLoad(state.register_value()),
        None => ConnectAction::StartPolling,
    };
    info!(
        "Starting daemon mode: device={:?}, interval={:?}, sinks={}, on_connect={action:?}",
        link.selector,
        link.poll.interval,
        sinks.len()
    );

    let transport = Arc::new(BleTransport::default());
    let dispatcher = dispatcher(&link, transport.clone(), sinks, action);

    let ble = BleLink::connect(&link.selector, link.scan_timeout).await?;
    dispatcher.on_resolving().await;
    let result = async {
        let notify = ble.resolve(&transport).await?;
        let mut notifications = crate::ble::notifications(&notify).await?;
        let mut assembler = FrameAssembler::default();
        if let Err(err) = dispatcher.on_transport_ready().await {
            error!("Initial request failed: {err}");
        }

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Interrupted, shutting down");
                    break Ok(());
                }
                frame = assembler.next_frame(&mut notifications, NOTIFICATION_GAP) => {
                    match frame {
                        Ok(Some(frame)) => dispatcher.on_notification(&frame).await,
                        Ok(None) => {
                            warn!("Notification stream ended");
                            break Ok(());
                        }
                        Err(err) => break Err(anyhow::Error::from(err).context("Notification stream failed")),
                    }
                }
            }
        }
    }
    .await;

    dispatcher.on_disconnected().await;
    if let Err(err) = ble.disconnect().await {
        warn!("Disconnect failed: {err}");
    }
    result
}

/// Forwards write acknowledgements to whoever waits for them.
struct AckSink {
    tx: mpsc::Sender<WriteAck>,
}

#[async_trait]
impl Sink for AckSink {
    fn name(&self) -> &str {
        "ack"
    }

    async fn on_read_result(&self, _record: &TelemetryRecord) -> SinkResult {
        Ok(())
    }

    async fn on_write_result(&self, ack: &WriteAck) -> SinkResult {
        self.tx.send(*ack).await.map_err(Into::into)
    }
}

/// Switches the load once and waits for the controller to echo the write.
pub async fn set_load(link: LinkOptions, state: LoadSwitch, wait: Duration) -> Result<()> {
    let value = state.register_value();
    let (tx, mut rx) = mpsc::channel(1);
    let ack_sink: Arc<dyn Sink> = Arc::new(AckSink { tx });
    let transport = Arc::new(BleTransport::default());
    let dispatcher = dispatcher(
        &link,
        transport.clone(),
        vec![ack_sink],
        ConnectAction::SetLoad(value),
    );

    let ble = BleLink::connect(&link.selector, link.scan_timeout).await?;
    dispatcher.on_resolving().await;
    let result = async {
        let notify = ble.resolve(&transport).await?;
        let mut notifications = crate::ble::notifications(&notify).await?;
        let mut assembler = FrameAssembler::default();
        dispatcher
            .on_transport_ready()
            .await
            .context("Cannot send load write")?;

        let ack = tokio::time::timeout(wait, async {
            loop {
                tokio::select! {
                    ack = rx.recv() => return ack.context("Acknowledgement channel closed"),
                    frame = assembler.next_frame(&mut notifications, NOTIFICATION_GAP) => {
                        match frame? {
                            Some(frame) => dispatcher.on_notification(&frame).await,
                            None => bail!("Notification stream ended before the acknowledgement"),
                        }
                    }
                }
            }
        })
        .await
        .map_err(|_| anyhow::anyhow!("No acknowledgement within {wait:?}"))??;

        if ack.register != link.poll.load_register || ack.value != value {
            bail!(
                "Controller acknowledged register {:#06x} = {} instead of {:#06x} = {value}",
                ack.register,
                ack.value,
                link.poll.load_register
            );
        }
        info!("Load switched {state:?}");
        Ok(())
    }
    .await;

    dispatcher.on_disconnected().await;
    if let Err(err) = ble.disconnect().await {
        warn!("Disconnect failed: {err}");
    }
    result
}

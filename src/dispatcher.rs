//! Glue between the BLE transport, the poll timer, the decoder and the sinks.
//!
//! The transport collaborator reports connection progress and raw
//! notifications; the dispatcher turns those into poll requests and typed
//! results. A read and a load write are issued independently: nothing
//! serializes [`Dispatcher::set_load`] against a pending poll, and replies are
//! told apart only by their operation code.

use crate::error::BoxError;
use crate::protocol::{self, FrameDecoder, Response, WriteAck};
use crate::scheduler::{PollScheduler, SchedulerState};
use crate::telemetry::TelemetryRecord;
use crate::{Error, ProtocolError};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Write half of the BLE link. Implementations map their own failures onto
/// [`Error::TransportWriteFailed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn write(&self, frame: &[u8]) -> Result<(), Error>;
}

pub type SinkResult = Result<(), BoxError>;

/// Consumer of decoded results. Failures are logged by the dispatcher and
/// never interrupt polling.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn on_connected(&self) -> SinkResult {
        Ok(())
    }

    async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult;

    async fn on_write_result(&self, _ack: &WriteAck) -> SinkResult {
        Ok(())
    }

    async fn on_error(&self, _error: &ProtocolError) -> SinkResult {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Resolving,
    Ready,
}

/// What the dispatcher does once the transport is ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectAction {
    #[default]
    StartPolling,
    SetLoad(u16),
    Idle,
}

#[derive(Debug, Clone)]
pub struct PollConfig {
    pub device_address: u8,
    pub interval: Duration,
    pub register: u16,
    pub word_count: u16,
    pub load_register: u16,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            device_address: protocol::DEFAULT_DEVICE_ADDRESS,
            interval: Duration::from_secs(30),
            register: protocol::STATUS_REGISTER,
            word_count: protocol::STATUS_WORDS,
            load_register: protocol::LOAD_REGISTER,
        }
    }
}

#[derive(Debug)]
struct PollSession {
    interval: Duration,
    scheduler: PollScheduler,
}

#[derive(Debug)]
struct SessionState {
    connection: ConnectionState,
    poll: Option<PollSession>,
    latest: Option<TelemetryRecord>,
}

pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    config: PollConfig,
    on_connect: ConnectAction,
    decoder: FrameDecoder,
    sinks: Vec<Arc<dyn Sink>>,
    state: Mutex<SessionState>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(transport: Arc<T>, config: PollConfig) -> Self {
        Self {
            transport,
            config,
            on_connect: ConnectAction::default(),
            decoder: FrameDecoder::default(),
            sinks: Vec::new(),
            state: Mutex::new(SessionState {
                connection: ConnectionState::Disconnected,
                poll: None,
                latest: None,
            }),
        }
    }

    pub fn with_decoder(mut self, decoder: FrameDecoder) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_connect_action(mut self, action: ConnectAction) -> Self {
        self.on_connect = action;
        self
    }

    pub fn config(&self) -> &PollConfig {
        &self.config
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.state.lock().await.connection
    }

    /// Most recent record of the current session.
    pub async fn latest_record(&self) -> Option<TelemetryRecord> {
        self.state.lock().await.latest.clone()
    }

    pub async fn is_polling(&self) -> bool {
        self.state
            .lock()
            .await
            .poll
            .as_ref()
            .is_some_and(|session| session.scheduler.state() == SchedulerState::Armed)
    }

    /// The transport is connected and resolving services.
    pub async fn on_resolving(&self) {
        self.state.lock().await.connection = ConnectionState::Resolving;
        log::debug!("Resolving services");
    }

    /// Services resolved; runs the configured [`ConnectAction`].
    ///
    /// A failed write is returned to the caller. Polling stays armed regardless.
    pub async fn on_transport_ready(&self) -> Result<(), Error> {
        self.state.lock().await.connection = ConnectionState::Ready;
        log::info!("Resolved services");

        for sink in &self.sinks {
            if let Err(err) = sink.on_connected().await {
                log::error!("Sink '{}' failed on connect: {err}", sink.name());
            }
        }

        match self.on_connect {
            ConnectAction::StartPolling => {
                self.start_polling().await?;
                self.read_cycle().await
            }
            ConnectAction::SetLoad(value) => self.set_load(value.into()).await,
            ConnectAction::Idle => Ok(()),
        }
    }

    /// Arms (or re-arms) the poll timer for the current session.
    pub async fn start_polling(&self) -> Result<(), Error> {
        let request: Arc<[u8]> = self.read_request()?.into();
        let transport = self.transport.clone();

        let mut state = self.state.lock().await;
        let session = state.poll.get_or_insert_with(|| PollSession {
            interval: self.config.interval,
            scheduler: PollScheduler::new(),
        });
        session.scheduler.start(session.interval, move || {
            let transport = transport.clone();
            let request = request.clone();
            async move {
                log::debug!("Reading params");
                if let Err(err) = transport.write(&request).await {
                    log::error!("Poll request failed: {err}");
                }
            }
        })
    }

    /// Issues one read request now.
    pub async fn read_cycle(&self) -> Result<(), Error> {
        log::debug!("Reading params");
        let request = self.read_request()?;
        self.send(&request).await
    }

    /// Switches the load output. Independent of the poll timer.
    pub async fn set_load(&self, value: u32) -> Result<(), Error> {
        log::debug!("Setting load {value}");
        let request = protocol::build_write_request(
            self.config.device_address,
            self.config.load_register,
            value,
        )?;
        self.send(&request).await
    }

    /// Decodes one notification and forwards the result. Bad frames are
    /// logged and dropped; the next poll is the retry.
    pub async fn on_notification(&self, rx_buffer: &[u8]) {
        log::trace!("receive_bytes: {rx_buffer:02X?}");
        match self.decoder.parse(rx_buffer) {
            Ok(Response::Telemetry(record)) => {
                log::debug!("Response for read operation: {record:?}");
                self.state.lock().await.latest = Some(record.clone());
                for sink in &self.sinks {
                    if let Err(err) = sink.on_read_result(&record).await {
                        log::error!("Sink '{}' failed to handle record: {err}", sink.name());
                    }
                }
            }
            Ok(Response::WriteAck(ack)) => {
                log::info!(
                    "Register {:#06x} acknowledged value {}",
                    ack.register,
                    ack.value
                );
                for sink in &self.sinks {
                    if let Err(err) = sink.on_write_result(&ack).await {
                        log::error!("Sink '{}' failed to handle write ack: {err}", sink.name());
                    }
                }
            }
            Err(ProtocolError::UnknownOperation(code)) => {
                log::info!("Ignoring frame with unknown operation={code}");
            }
            Err(err) => {
                log::warn!("Dropping frame: {err}");
                for sink in &self.sinks {
                    if let Err(sink_err) = sink.on_error(&err).await {
                        log::error!("Sink '{}' failed to handle error: {sink_err}", sink.name());
                    }
                }
            }
        }
    }

    /// Tears down the poll session. Safe to call more than once.
    pub async fn on_disconnected(&self) {
        let mut state = self.state.lock().await;
        if let Some(mut session) = state.poll.take() {
            session.scheduler.stop();
        }
        state.latest = None;
        state.connection = ConnectionState::Disconnected;
        log::info!("Disconnected");
    }

    fn read_request(&self) -> Result<Vec<u8>, Error> {
        protocol::build_read_request(
            self.config.device_address,
            self.config.register,
            self.config.word_count.into(),
        )
    }

    async fn send(&self, request: &[u8]) -> Result<(), Error> {
        log::trace!("write bytes: {request:02X?}");
        self.transport.write(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::append_crc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct FakeTransport {
        writes: std::sync::Mutex<Vec<Vec<u8>>>,
        fail: AtomicBool,
    }

    impl FakeTransport {
        fn writes(&self) -> Vec<Vec<u8>> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn write(&self, frame: &[u8]) -> Result<(), Error> {
            self.writes.lock().unwrap().push(frame.to_vec());
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::TransportWriteFailed("link lost".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        events: std::sync::Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSink {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Default::default()
            }
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn push(&self, event: String) -> SinkResult {
            self.events.lock().unwrap().push(event);
            if self.fail {
                return Err("sink down".into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            "recording"
        }

        async fn on_connected(&self) -> SinkResult {
            self.push("connected".into())
        }

        async fn on_read_result(&self, record: &TelemetryRecord) -> SinkResult {
            self.push(format!("read {}", record.battery_percentage))
        }

        async fn on_write_result(&self, ack: &WriteAck) -> SinkResult {
            self.push(format!("write {} {}", ack.register, ack.value))
        }

        async fn on_error(&self, error: &ProtocolError) -> SinkResult {
            self.push(format!("error {error}"))
        }
    }

    const READ_REQUEST: &str = "ff0301000022d1f1";

    fn status_reply(percentage: u16) -> Vec<u8> {
        let mut frame = vec![0xff, 0x03, 68];
        let mut payload = [0u8; 68];
        payload[0..2].copy_from_slice(&percentage.to_be_bytes());
        frame.extend_from_slice(&payload);
        append_crc(&mut frame);
        frame
    }

    fn setup(
        action: ConnectAction,
    ) -> (Arc<FakeTransport>, Arc<RecordingSink>, Dispatcher<FakeTransport>) {
        let transport = Arc::new(FakeTransport::default());
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(transport.clone(), PollConfig::default())
            .with_sink(sink.clone())
            .with_connect_action(action);
        (transport, sink, dispatcher)
    }

    #[tokio::test(start_paused = true)]
    async fn ready_polls_now_and_every_interval() {
        let (transport, sink, dispatcher) = setup(ConnectAction::StartPolling);
        dispatcher.on_resolving().await;
        assert_eq!(
            dispatcher.connection_state().await,
            ConnectionState::Resolving
        );

        dispatcher.on_transport_ready().await.unwrap();
        assert_eq!(dispatcher.connection_state().await, ConnectionState::Ready);
        assert_eq!(sink.events(), vec!["connected".to_string()]);
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(hex::encode(&transport.writes()[0]), READ_REQUEST);
        assert!(dispatcher.is_polling().await);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.writes().len(), 2);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(transport.writes().len(), 3);
        assert!(transport
            .writes()
            .iter()
            .all(|w| hex::encode(w) == READ_REQUEST));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_is_returned_but_polling_continues() {
        let (transport, _sink, dispatcher) = setup(ConnectAction::StartPolling);
        transport.fail.store(true, Ordering::SeqCst);

        let result = dispatcher.on_transport_ready().await;
        assert!(matches!(result, Err(Error::TransportWriteFailed(_))));
        assert!(matches!(
            dispatcher.read_cycle().await,
            Err(Error::TransportWriteFailed(_))
        ));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(transport.writes().len(), 4);
        assert!(dispatcher.is_polling().await);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_polling_and_clears_session() {
        let (transport, _sink, dispatcher) = setup(ConnectAction::StartPolling);
        dispatcher.on_transport_ready().await.unwrap();
        dispatcher.on_notification(&status_reply(80)).await;
        assert!(dispatcher.latest_record().await.is_some());

        dispatcher.on_disconnected().await;
        dispatcher.on_disconnected().await;
        assert_eq!(
            dispatcher.connection_state().await,
            ConnectionState::Disconnected
        );
        assert!(dispatcher.latest_record().await.is_none());
        assert!(!dispatcher.is_polling().await);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.writes().len(), 1);

        // a new session after reconnecting polls again
        dispatcher.on_transport_ready().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(transport.writes().len(), 3);
    }

    #[tokio::test]
    async fn telemetry_reaches_sinks() {
        let (_transport, sink, dispatcher) = setup(ConnectAction::Idle);
        dispatcher.on_notification(&status_reply(100)).await;
        assert_eq!(sink.events(), vec!["read 100".to_string()]);
        assert_eq!(
            dispatcher.latest_record().await.unwrap().battery_percentage,
            100.0
        );
    }

    #[tokio::test]
    async fn unknown_operation_invokes_no_sink() {
        let (_transport, sink, dispatcher) = setup(ConnectAction::Idle);
        let mut frame = vec![0xff, 0x09, 0x00, 0x00];
        append_crc(&mut frame);
        dispatcher.on_notification(&frame).await;
        assert!(sink.events().is_empty());
        assert!(dispatcher.latest_record().await.is_none());
    }

    #[tokio::test]
    async fn corrupt_frame_reported_as_error() {
        let (_transport, sink, dispatcher) = setup(ConnectAction::Idle);
        let mut frame = status_reply(100);
        frame[10] ^= 0x01;
        dispatcher.on_notification(&frame).await;
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].starts_with("error Invalid checksum"));
        assert!(dispatcher.latest_record().await.is_none());
    }

    #[tokio::test]
    async fn set_load_writes_immediately_without_polling() {
        let (transport, sink, dispatcher) = setup(ConnectAction::Idle);
        dispatcher.set_load(1).await.unwrap();
        assert_eq!(hex::encode(&transport.writes()[0]), "ff06010a00017c2a");
        assert!(!dispatcher.is_polling().await);

        dispatcher
            .on_notification(&hex::decode("ff06010a00017c2a").unwrap())
            .await;
        assert_eq!(sink.events(), vec!["write 266 1".to_string()]);

        assert!(matches!(
            dispatcher.set_load(0x1_0000).await,
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(transport.writes().len(), 1);
    }

    #[tokio::test]
    async fn connect_action_can_set_load() {
        let (transport, _sink, dispatcher) = setup(ConnectAction::SetLoad(0));
        dispatcher.on_transport_ready().await.unwrap();
        assert_eq!(transport.writes().len(), 1);
        assert_eq!(hex::encode(&transport.writes()[0]), "ff06010a0000bdea");
        assert!(!dispatcher.is_polling().await);
    }

    #[tokio::test]
    async fn failing_sink_does_not_stop_others() {
        let transport = Arc::new(FakeTransport::default());
        let failing = Arc::new(RecordingSink::failing());
        let healthy = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::new(transport, PollConfig::default())
            .with_sink(failing.clone())
            .with_sink(healthy.clone())
            .with_connect_action(ConnectAction::Idle);

        dispatcher.on_transport_ready().await.unwrap();
        dispatcher.on_notification(&status_reply(42)).await;
        assert_eq!(failing.events().len(), 2);
        assert_eq!(
            healthy.events(),
            vec!["connected".to_string(), "read 42".to_string()]
        );
    }
}

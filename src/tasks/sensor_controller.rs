use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, trace, warn};

use crate::{
    externals::{
        sensors::services::{SensorError, SensorReader},
        telemetry::services::TelemetrySink,
    },
    models::{
        measurement::{Measurement, SensorProfile},
        sensor_command::SensorCommand,
    },
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// A command together with the sender its acknowledgment goes back on.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: SensorCommand,
    pub tx_ack: oneshot::Sender<()>,
}

/// Controller side of a command channel.
pub struct CommandEndpoint {
    pub rx_request: mpsc::Receiver<CommandRequest>,
}

/// A running acquisition loop and the token that wakes it for shutdown.
struct Acquisition {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one sensor's running state and its acquisition loop.
pub struct SensorController {
    profile: SensorProfile,
    reader: Arc<dyn SensorReader>,
    sink: Arc<dyn TelemetrySink>,
    tracker: TaskTracker,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    tx_last_measurement: Arc<watch::Sender<Option<Measurement>>>,
    acquisition: Option<Acquisition>,
}

impl SensorController {
    pub fn new(
        profile: SensorProfile,
        reader: Arc<dyn SensorReader>,
        sink: Arc<dyn TelemetrySink>,
        tracker: TaskTracker,
    ) -> Self {
        let (tx_last_measurement, _) = watch::channel(None);
        Self {
            profile,
            reader,
            sink,
            tracker,
            poll_interval: DEFAULT_POLL_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            tx_last_measurement: Arc::new(tx_last_measurement),
            acquisition: None,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Receiver for the last measurement successfully read.
    pub fn subscribe(&self) -> watch::Receiver<Option<Measurement>> {
        self.tx_last_measurement.subscribe()
    }

    /// Acquire the bus handle. A failure is a startup precondition failure.
    pub fn open(&self) -> Result<(), SensorError> {
        info!("Opening sensor {}...", self.profile.name);
        self.reader.open()?;
        info!("...ok");
        Ok(())
    }

    /// Release the bus handle. Errors are logged, never returned.
    pub fn close(&self) {
        match self.reader.halt() {
            Ok(_) => debug!("Released sensor {}.", self.profile.name),
            Err(e) => warn!("Failed to halt sensor {}. Error: {}", self.profile.name, e),
        }
    }

    /// Apply a single command. Returns once the transition has taken effect:
    /// after a start the loop is spawned, after a stop the loop has exited.
    pub async fn apply(&mut self, command: SensorCommand) {
        match command {
            SensorCommand::Start => self.start_acquisition(),
            SensorCommand::Stop => self.stop_acquisition().await,
        }
    }

    fn start_acquisition(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            info!("Sensor {} already running.", self.profile.name);
            return;
        }
        info!("Starting sensor {}.", self.profile.name);
        let token = CancellationToken::new();
        let handle = self.tracker.spawn(task_acquire_measurements(
            token.clone(),
            self.running.clone(),
            self.profile.clone(),
            self.reader.clone(),
            self.sink.clone(),
            self.poll_interval,
            self.tx_last_measurement.clone(),
        ));
        self.acquisition = Some(Acquisition { token, handle });
    }

    async fn stop_acquisition(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            info!("Sensor {} not running.", self.profile.name);
            return;
        }
        if let Some(Acquisition { token, handle }) = self.acquisition.take() {
            token.cancel();
            if let Err(e) = handle.await {
                error!(
                    "Acquisition loop of sensor {} ended abnormally. Error: {}",
                    self.profile.name, e
                );
            }
        }
        info!("Stopped sensor {}.", self.profile.name);
    }
}

/// Task: Process commands for one controller, acknowledging each exactly once
/// after it has taken effect. A request whose sender has given up is still
/// applied in full. Runs until the command channel is closed, then stops
/// acquisition and hands the controller back for release.
#[tracing::instrument(skip_all, fields(sensor = %controller.name()))]
pub async fn task_monitor_sensor(
    mut controller: SensorController,
    endpoint: CommandEndpoint,
) -> SensorController {
    info!("Started.");
    let CommandEndpoint { mut rx_request } = endpoint;

    while let Some(CommandRequest { command, tx_ack }) = rx_request.recv().await {
        debug!("Received command: {}", command);
        controller.apply(command).await;
        if tx_ack.send(()).is_err() {
            warn!("Requester of {} went away before the acknowledgment.", command);
            continue;
        }
        trace!("Acknowledged command: {}", command);
    }

    warn!("Command channel closed.");
    if controller.is_running() {
        controller.apply(SensorCommand::Stop).await;
    }
    controller
}

/// Task: Read the sensor and publish the sample once per poll interval while
/// the controller is running. A failed read or write is logged and the next
/// tick proceeds as usual.
#[tracing::instrument(skip_all, fields(sensor = %profile.name))]
async fn task_acquire_measurements(
    token: CancellationToken,
    running: Arc<AtomicBool>,
    profile: SensorProfile,
    reader: Arc<dyn SensorReader>,
    sink: Arc<dyn TelemetrySink>,
    poll_interval: Duration,
    tx_last_measurement: Arc<watch::Sender<Option<Measurement>>>,
) {
    info!("Started.");
    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        business_logic(&profile, &reader, sink.as_ref(), &tx_last_measurement).await;

        tokio::select! {
            _ = token.cancelled() => {
                debug!("Cancelled.");
                break;
            },
            _ = tokio::time::sleep(poll_interval) => {}
        };
    }
    info!("Stopped.");
}

/// Perform one acquisition tick: read, remember, publish.
async fn business_logic(
    profile: &SensorProfile,
    reader: &Arc<dyn SensorReader>,
    sink: &dyn TelemetrySink,
    tx_last_measurement: &watch::Sender<Option<Measurement>>,
) {
    trace!("Executing business logic.");
    let blocking_reader = reader.clone();
    let reading = match tokio::task::spawn_blocking(move || blocking_reader.read()).await {
        Ok(Ok(reading)) => reading,
        Ok(Err(e)) => {
            error!("Failed to read sensor. Error: {}", e);
            return;
        }
        Err(e) => {
            error!("Sensor read task failed. Error: {}", e);
            return;
        }
    };

    let measurement = Measurement::new(profile, reading, chrono::Utc::now());
    info!("{}", measurement.reading);
    tx_last_measurement.send_replace(Some(measurement.clone()));

    if let Err(e) = sink.write(&measurement).await {
        error!("Failed to write measurement. Error: {}", e);
    } else {
        debug!("Wrote measurement {}.", measurement.name);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use futures::future::BoxFuture;

    use super::*;
    use crate::{
        externals::telemetry::services::TelemetryError, models::measurement::Reading,
    };

    /// Reader that fails its first `failures` reads and counts concurrent reads.
    #[derive(Default)]
    pub(crate) struct FakeReader {
        pub failures: AtomicUsize,
        pub reads: AtomicUsize,
        pub in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        pub halts: AtomicUsize,
        pub fail_open: bool,
        pub read_delay: Duration,
    }

    impl FakeReader {
        pub(crate) fn failing(failures: usize) -> Self {
            Self {
                failures: AtomicUsize::new(failures),
                ..Default::default()
            }
        }

        pub(crate) fn slow(read_delay: Duration) -> Self {
            Self {
                read_delay,
                ..Default::default()
            }
        }
    }

    impl SensorReader for FakeReader {
        fn open(&self) -> Result<(), SensorError> {
            if self.fail_open {
                return Err(SensorError::NotOpen);
            }
            Ok(())
        }

        fn read(&self) -> Result<Reading, SensorError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(2) + self.read_delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            self.reads.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(SensorError::Timeout);
            }
            Ok(Reading::Environment {
                temperature_celsius: 21.0,
                pressure_hpa: 1000.0,
                humidity_percent: 40.0,
            })
        }

        fn halt(&self) -> Result<(), SensorError> {
            self.halts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub written: Mutex<Vec<Measurement>>,
    }

    impl RecordingSink {
        pub(crate) fn count(&self) -> usize {
            self.written.lock().unwrap().len()
        }
    }

    impl TelemetrySink for RecordingSink {
        fn write<'a>(
            &'a self,
            measurement: &'a Measurement,
        ) -> BoxFuture<'a, Result<(), TelemetryError>> {
            self.written.lock().unwrap().push(measurement.clone());
            Box::pin(futures::future::ready(Ok(())))
        }
    }

    struct FailingSink;

    impl TelemetrySink for FailingSink {
        fn write<'a>(
            &'a self,
            measurement: &'a Measurement,
        ) -> BoxFuture<'a, Result<(), TelemetryError>> {
            Box::pin(futures::future::ready(Err(TelemetryError::NoFields(
                measurement.name.clone(),
            ))))
        }
    }

    pub(crate) fn profile(name: &str) -> SensorProfile {
        SensorProfile {
            name: name.into(),
            measurement: format!("environment_{}", name.to_lowercase()),
            location: "office".into(),
        }
    }

    pub(crate) fn controller(
        name: &str,
        reader: Arc<FakeReader>,
        sink: Arc<dyn TelemetrySink>,
        poll_interval: Duration,
    ) -> SensorController {
        SensorController::new(profile(name), reader, sink, TaskTracker::new())
            .with_poll_interval(poll_interval)
    }

    const FAST: Duration = Duration::from_millis(10);

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_running_reflects_last_command() {
        let reader = Arc::new(FakeReader::default());
        let sink = Arc::new(RecordingSink::default());
        let mut controller = controller("A", reader.clone(), sink, FAST);

        let commands = [
            SensorCommand::Start,
            SensorCommand::Start,
            SensorCommand::Stop,
            SensorCommand::Stop,
            SensorCommand::Start,
            SensorCommand::Stop,
            SensorCommand::Start,
        ];
        for command in commands {
            controller.apply(command).await;
            assert_eq!(controller.is_running(), command == SensorCommand::Start);
            assert_eq!(
                controller.acquisition.is_some(),
                command == SensorCommand::Start
            );
        }
        tokio::time::sleep(FAST * 5).await;
        controller.apply(SensorCommand::Stop).await;
        assert_eq!(reader.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_no_measurements_after_stop() {
        let reader = Arc::new(FakeReader::default());
        let sink = Arc::new(RecordingSink::default());
        let mut controller = controller("A", reader.clone(), sink.clone(), FAST);

        controller.apply(SensorCommand::Start).await;
        tokio::time::sleep(FAST * 4).await;
        controller.apply(SensorCommand::Stop).await;

        let after_stop = sink.count();
        assert!(after_stop > 0);
        tokio::time::sleep(FAST * 5).await;
        assert_eq!(sink.count(), after_stop);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_reads_do_not_stop_acquisition() {
        let reader = Arc::new(FakeReader::failing(3));
        let sink = Arc::new(RecordingSink::default());
        let mut controller = controller("A", reader.clone(), sink.clone(), FAST);
        let mut rx_last = controller.subscribe();

        controller.apply(SensorCommand::Start).await;
        tokio::time::timeout(Duration::from_secs(2), rx_last.changed())
            .await
            .expect("No measurement after failed reads")
            .unwrap();
        controller.apply(SensorCommand::Stop).await;

        assert!(reader.reads.load(Ordering::SeqCst) >= 4);
        assert!(sink.count() >= 1);
        assert!(rx_last.borrow().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_writes_do_not_stop_acquisition() {
        let reader = Arc::new(FakeReader::default());
        let mut controller = controller("A", reader.clone(), Arc::new(FailingSink), FAST);

        controller.apply(SensorCommand::Start).await;
        tokio::time::sleep(FAST * 5).await;
        assert!(controller.is_running());
        controller.apply(SensorCommand::Stop).await;
        assert!(reader.reads.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_acks_every_command_once() {
        let reader = Arc::new(FakeReader::default());
        let sink = Arc::new(RecordingSink::default());
        let controller = controller("A", reader.clone(), sink, FAST);
        let (tx_request, rx_request) = mpsc::channel(1);
        let monitor = tokio::spawn(task_monitor_sensor(
            controller,
            CommandEndpoint { rx_request },
        ));

        let send = |command: SensorCommand| {
            let tx_request = tx_request.clone();
            async move {
                let (tx_ack, rx_ack) = oneshot::channel();
                tx_request
                    .send(CommandRequest { command, tx_ack })
                    .await
                    .unwrap();
                rx_ack
            }
        };

        for command in [SensorCommand::Start, SensorCommand::Start, SensorCommand::Stop] {
            assert_eq!(send(command).await.await, Ok(()));
        }

        // An abandoned request is still applied.
        drop(send(SensorCommand::Start).await);
        assert_eq!(send(SensorCommand::Stop).await.await, Ok(()));

        assert_eq!(send(SensorCommand::Start).await.await, Ok(()));
        drop(send);
        drop(tx_request);

        let controller = monitor.await.expect("Monitor panicked");
        assert!(!controller.is_running());
        assert!(controller.acquisition.is_none());
        controller.close();
        assert_eq!(reader.halts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_open_failure_is_reported() {
        let reader = Arc::new(FakeReader {
            fail_open: true,
            ..Default::default()
        });
        let controller = controller("A", reader, Arc::new(RecordingSink::default()), FAST);
        assert!(controller.open().is_err());
    }
}

//! The platform driver: lifecycle, event dispatch and the poll scheduler.
//!
//! # Event handling
//!
//! Events are routed through an explicit `(state, event) -> handler` table. Events
//! without an entry for the current state fail with [`PlatformError::InvalidState`].
//!
//! Commands only run while connected. A [`PlatformError::Connection`] raised by a
//! command is not returned to the caller: the driver tears the connection down,
//! reports [`DriverAsyncEvent::ConnectionLost`] with the originating event and
//! arguments, and answers with a transition to [`DriverState::Disconnected`].
//! Protocol and argument errors are returned unchanged.
//!
//! # Concurrency
//!
//! [`PlatformDriver::run_event_loop`] handles one request at a time from a bounded
//! queue. The poll scheduler is a separate task that only enqueues
//! [`PlatformDriverEvent::AcquireSample`]; it never touches the OMS client. On
//! disconnect the scheduler is aborted before the client is released.
//!
//! ```text
//!  DriverHandle ──┐
//!                 ├──> queue ──> run_event_loop ──> execute ──> CommandExecutor ──> OMS
//!  scheduler ─────┘                    │
//!                                      └──> DriverAsyncEvent (samples, state changes)
//! ```

use crate::config::DriverSettings;
use crate::error::{PlatformError, PlatformResult};
use crate::error_recovery::{handle_recoverable_error, Recoverable, RetryPolicy};
use crate::node_config::NodeConfiguration;
use crate::oms::OmsClientFactory;
use crate::platform::events::{
    filter_capabilities, CommandArgs, CommandOutcome, DriverAsyncEvent, DriverState,
    EmittedSample, PlatformDriverEvent,
};
use crate::platform::executor::{attribute_values_to_json, CommandExecutor};
use crate::platform::poller::TelemetryPoller;
use crate::platform::ports::PortMapper;
use crate::time::ntp_now;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Capacity of the driver request queue.
pub const QUEUE_CAPACITY: usize = 32;

type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

/// Handler selected for a `(state, event)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Configure,
    Connect,
    Disconnect,
    Ping,
    PollTelemetry,
    TurnOnPort,
    TurnOffPort,
    SetOverCurrent,
    StartMission,
    StopMission,
    MissionStatus,
    AvailableMissions,
}

use DriverState::{Connected, Disconnected, Unconfigured};
use PlatformDriverEvent as Ev;

const HANDLERS: &[(DriverState, PlatformDriverEvent, Handler)] = &[
    (Unconfigured, Ev::Configure, Handler::Configure),
    (Disconnected, Ev::Configure, Handler::Configure),
    (Disconnected, Ev::Connect, Handler::Connect),
    (Connected, Ev::Disconnect, Handler::Disconnect),
    (Connected, Ev::Ping, Handler::Ping),
    (Connected, Ev::GetEngData, Handler::PollTelemetry),
    (Connected, Ev::AcquireSample, Handler::PollTelemetry),
    (Connected, Ev::TurnOnPort, Handler::TurnOnPort),
    (Connected, Ev::TurnOffPort, Handler::TurnOffPort),
    (Connected, Ev::SetPortOverCurrentLimits, Handler::SetOverCurrent),
    (Connected, Ev::StartProfilerMission, Handler::StartMission),
    (Connected, Ev::StopProfilerMission, Handler::StopMission),
    (Connected, Ev::GetMissionStatus, Handler::MissionStatus),
    (Connected, Ev::GetAvailableMissions, Handler::AvailableMissions),
];

fn route(state: DriverState, event: PlatformDriverEvent) -> Option<Handler> {
    HANDLERS
        .iter()
        .find(|(s, e, _)| *s == state && *e == event)
        .map(|(_, _, handler)| *handler)
}

/// Read request answered outside the event table.
#[derive(Debug, Clone, PartialEq)]
pub enum GetRequest {
    /// Attribute values: a sequence of `[attr_id, from_time]`
    Attrs(Value),
    /// Node metadata
    Metadata,
}

enum DriverRequest {
    Execute {
        event: PlatformDriverEvent,
        args: CommandArgs,
        respond_to: Option<oneshot::Sender<PlatformResult<CommandOutcome>>>,
    },
    Get {
        request: GetRequest,
        respond_to: oneshot::Sender<PlatformResult<Value>>,
    },
    Reconnect {
        respond_to: oneshot::Sender<PlatformResult<Option<CommandOutcome>>>,
    },
    Shutdown,
}

/// Cloneable handle that queues requests for a running event loop.
#[derive(Clone)]
pub struct DriverHandle {
    tx: mpsc::Sender<DriverRequest>,
}

impl DriverHandle {
    /// Execute `event` and wait for its outcome.
    pub async fn execute(
        &self,
        event: PlatformDriverEvent,
        args: CommandArgs,
    ) -> PlatformResult<CommandOutcome> {
        let (respond_to, rx) = oneshot::channel();
        self.send(DriverRequest::Execute {
            event,
            args,
            respond_to: Some(respond_to),
        })
        .await?;
        rx.await.map_err(|_| PlatformError::EventLoopClosed)?
    }

    /// Queue `event` without waiting.
    pub async fn enqueue(&self, event: PlatformDriverEvent, args: CommandArgs) -> PlatformResult<()> {
        self.send(DriverRequest::Execute {
            event,
            args,
            respond_to: None,
        })
        .await
    }

    /// Answer a read request.
    pub async fn get(&self, request: GetRequest) -> PlatformResult<Value> {
        let (respond_to, rx) = oneshot::channel();
        self.send(DriverRequest::Get { request, respond_to }).await?;
        rx.await.map_err(|_| PlatformError::EventLoopClosed)?
    }

    /// Reconnect and replay the event that lost the connection.
    pub async fn reconnect(&self) -> PlatformResult<Option<CommandOutcome>> {
        let (respond_to, rx) = oneshot::channel();
        self.send(DriverRequest::Reconnect { respond_to }).await?;
        rx.await.map_err(|_| PlatformError::EventLoopClosed)?
    }

    /// Stop the event loop after the requests already queued.
    pub async fn shutdown(&self) -> PlatformResult<()> {
        self.send(DriverRequest::Shutdown).await
    }

    async fn send(&self, request: DriverRequest) -> PlatformResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| PlatformError::EventLoopClosed)
    }
}

/// RSN OMS platform driver.
pub struct PlatformDriver {
    state: DriverState,
    factory: Arc<dyn OmsClientFactory>,
    settings: Option<DriverSettings>,
    node: Option<Arc<NodeConfiguration>>,
    executor: Option<CommandExecutor>,
    poller: TelemetryPoller,
    events: mpsc::UnboundedSender<DriverAsyncEvent>,
    queue_tx: mpsc::Sender<DriverRequest>,
    queue_rx: Option<mpsc::Receiver<DriverRequest>>,
    scheduler: Option<JoinHandle<()>>,
    pending_replay: Option<(PlatformDriverEvent, CommandArgs)>,
    clock: Clock,
}

impl PlatformDriver {
    /// Create an unconfigured driver and the receiver of its async events.
    pub fn new(
        factory: Arc<dyn OmsClientFactory>,
    ) -> (Self, mpsc::UnboundedReceiver<DriverAsyncEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let driver = Self {
            state: Unconfigured,
            factory,
            settings: None,
            node: None,
            executor: None,
            poller: TelemetryPoller::new(),
            events,
            queue_tx,
            queue_rx: Some(queue_rx),
            scheduler: None,
            pending_replay: None,
            clock: Arc::new(ntp_now),
        };
        (driver, events_rx)
    }

    /// Replace the NTP clock used by the poller.
    pub fn with_clock(mut self, clock: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Handle for queueing requests to [`run_event_loop`](Self::run_event_loop).
    pub fn handle(&self) -> DriverHandle {
        DriverHandle {
            tx: self.queue_tx.clone(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Node configuration, once configured.
    pub fn node(&self) -> Option<&NodeConfiguration> {
        self.node.as_deref()
    }

    /// Watermark of `stream`.
    pub fn watermark(&self, stream: &str) -> Option<f64> {
        self.poller.watermark(stream)
    }

    /// Forget all stream watermarks.
    pub fn reset_watermarks(&mut self) {
        self.poller.reset();
    }

    /// Event preserved by the last connection loss.
    pub fn pending_replay(&self) -> Option<&(PlatformDriverEvent, CommandArgs)> {
        self.pending_replay.as_ref()
    }

    /// Capability names executable in the current state.
    pub fn capabilities(&self) -> Vec<String> {
        let events: Vec<&str> = HANDLERS
            .iter()
            .filter(|(state, _, _)| *state == self.state)
            .map(|(_, event, _)| event.as_str())
            .collect();
        filter_capabilities(&events)
    }

    /// Apply a driver configuration and load the node file.
    pub fn configure(&mut self, settings: DriverSettings) -> PlatformResult<CommandOutcome> {
        self.check_route(Ev::Configure)?;
        self.apply_configuration(settings)?;
        Ok(CommandOutcome::transition(Disconnected))
    }

    /// Create the OMS client, verify it and start the poll scheduler.
    pub async fn connect(&mut self) -> PlatformResult<CommandOutcome> {
        self.execute(Ev::Connect, CommandArgs::new()).await
    }

    /// Stop the scheduler and release the OMS client.
    pub async fn disconnect(&mut self) -> PlatformResult<CommandOutcome> {
        self.execute(Ev::Disconnect, CommandArgs::new()).await
    }

    /// Execute `event` in the current state.
    pub async fn execute(
        &mut self,
        event: PlatformDriverEvent,
        args: CommandArgs,
    ) -> PlatformResult<CommandOutcome> {
        let handler = self.check_route(event)?;
        tracing::debug!(state = %self.state, %event, "dispatching event");

        match handler {
            Handler::Configure => {
                let settings: DriverSettings = serde_json::from_value(args.to_value())
                    .map_err(|e| PlatformError::Argument(format!("configure: {e}")))?;
                self.apply_configuration(settings)?;
                Ok(CommandOutcome::transition(Disconnected))
            }
            Handler::Connect => {
                self.open_connection().await?;
                self.discard_replay();
                Ok(CommandOutcome::transition(Connected))
            }
            Handler::Disconnect => {
                self.close_connection();
                self.discard_replay();
                Ok(CommandOutcome::transition(Disconnected))
            }
            command => {
                let result = self.run_command(command, &args).await;
                match result {
                    Ok(result) => Ok(CommandOutcome::stay(result)),
                    Err(PlatformError::Connection(reason)) => {
                        Ok(self.connection_lost(event, args, reason))
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Answer a read request.
    pub async fn get(&self, request: GetRequest) -> PlatformResult<Value> {
        match request {
            GetRequest::Attrs(attrs) => {
                let values = self.executor()?.get_attribute_values(&attrs).await?;
                Ok(attribute_values_to_json(&values))
            }
            GetRequest::Metadata => Ok(self.node_config()?.metadata()),
        }
    }

    /// Reconnect under the configured retry policy, then replay the event that
    /// lost the connection, if any.
    pub async fn reconnect(&mut self) -> PlatformResult<Option<CommandOutcome>> {
        if self.state != Disconnected {
            return Err(PlatformError::InvalidState {
                state: self.state,
                event: "reconnect".to_string(),
            });
        }
        let policy = self
            .settings
            .as_ref()
            .map(|s| s.reconnect.clone())
            .unwrap_or_else(RetryPolicy::default);
        handle_recoverable_error(self, &policy).await?;

        match self.pending_replay.take() {
            Some((event, args)) => {
                tracing::info!(%event, "replaying event after reconnection");
                self.execute(event, args).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Process queued requests one at a time until shutdown.
    pub async fn run_event_loop(&mut self) -> PlatformResult<()> {
        let mut rx = self.queue_rx.take().ok_or(PlatformError::EventLoopClosed)?;
        tracing::info!(state = %self.state, "driver event loop started");

        while let Some(request) = rx.recv().await {
            match request {
                DriverRequest::Execute {
                    event,
                    args,
                    respond_to,
                } => {
                    let result = self.execute(event, args).await;
                    match respond_to {
                        Some(tx) => {
                            let _ = tx.send(result);
                        }
                        None => {
                            if let Err(e) = result {
                                if event == Ev::AcquireSample {
                                    tracing::debug!(error = %e, "scheduled poll dropped");
                                } else {
                                    tracing::warn!(%event, error = %e, "queued event failed");
                                }
                            }
                        }
                    }
                }
                DriverRequest::Get {
                    request,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.get(request).await);
                }
                DriverRequest::Reconnect { respond_to } => {
                    let _ = respond_to.send(self.reconnect().await);
                }
                DriverRequest::Shutdown => break,
            }
        }

        self.queue_rx = Some(rx);
        tracing::info!(state = %self.state, "driver event loop stopped");
        Ok(())
    }

    fn check_route(&self, event: PlatformDriverEvent) -> PlatformResult<Handler> {
        route(self.state, event).ok_or_else(|| PlatformError::InvalidState {
            state: self.state,
            event: event.to_string(),
        })
    }

    fn executor(&self) -> PlatformResult<&CommandExecutor> {
        self.executor
            .as_ref()
            .ok_or_else(|| PlatformError::Configuration("driver is not configured".to_string()))
    }

    fn node_config(&self) -> PlatformResult<&Arc<NodeConfiguration>> {
        self.node
            .as_ref()
            .ok_or_else(|| PlatformError::Configuration("driver is not configured".to_string()))
    }

    fn apply_configuration(&mut self, settings: DriverSettings) -> PlatformResult<()> {
        if settings.oms_uri.trim().is_empty() {
            tracing::error!(config = ?settings, "'oms_uri' not present in driver config");
            return Err(PlatformError::Configuration(
                "driver config does not indicate 'oms_uri'".to_string(),
            ));
        }

        let node = NodeConfiguration::open(&settings.node_id, &settings.node_cfg_file)?;
        node.log_summary();

        self.executor = Some(CommandExecutor::new(&settings.node_id, PortMapper::new(&node)));
        self.node = Some(Arc::new(node));
        self.settings = Some(settings);
        self.poller.reset();
        self.set_state(Disconnected);
        Ok(())
    }

    async fn open_connection(&mut self) -> PlatformResult<()> {
        let (oms_uri, listener_url) = match &self.settings {
            Some(s) => (s.oms_uri.clone(), s.listener_url.clone()),
            None => {
                return Err(PlatformError::Configuration(
                    "driver is not configured".to_string(),
                ))
            }
        };

        tracing::debug!(%oms_uri, "creating OMS client");
        let client = self.factory.create_instance(&oms_uri).await?;
        let Some(executor) = self.executor.as_mut() else {
            self.factory.destroy_instance(client);
            return Err(PlatformError::Configuration(
                "driver is not configured".to_string(),
            ));
        };
        executor.attach(client);

        let verified = async {
            let executor = self.executor()?;
            executor.ping().await?;
            if let Some(url) = &listener_url {
                executor.register_event_listener(url).await?;
            }
            Ok::<(), PlatformError>(())
        }
        .await;

        if let Err(e) = verified {
            tracing::warn!(%oms_uri, error = %e, "OMS connection could not be verified");
            self.release_client();
            return Err(e);
        }

        if let Err(e) = self.start_scheduler() {
            self.release_client();
            return Err(e);
        }
        self.set_state(Connected);
        Ok(())
    }

    /// A replay is only valid for the connection loss that recorded it.
    fn discard_replay(&mut self) {
        if let Some((event, _)) = self.pending_replay.take() {
            tracing::info!(%event, "discarding event preserved for replay");
        }
    }

    fn start_scheduler(&mut self) -> PlatformResult<()> {
        let node = self.node_config()?;
        let sample_rate = node.sample_rate();
        let period = node.poll_period()?;

        let tx = self.queue_tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let request = DriverRequest::Execute {
                    event: Ev::AcquireSample,
                    args: CommandArgs::new(),
                    respond_to: None,
                };
                match tx.try_send(request) {
                    Ok(()) => tracing::trace!("poll event queued"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!("driver queue full, skipping poll tick");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
        });

        if let Some(previous) = self.scheduler.replace(task) {
            previous.abort();
        }
        tracing::debug!(period_secs = sample_rate, "poll scheduler started");
        Ok(())
    }

    /// Cancel the timer, then destroy the transport and clear the handle.
    fn close_connection(&mut self) {
        if let Some(task) = self.scheduler.take() {
            task.abort();
        }
        self.release_client();
        self.set_state(Disconnected);
    }

    fn release_client(&mut self) {
        if let Some(client) = self.executor.as_mut().and_then(CommandExecutor::detach) {
            self.factory.destroy_instance(client);
            tracing::debug!("OMS client destroyed");
        }
    }

    fn connection_lost(
        &mut self,
        event: PlatformDriverEvent,
        args: CommandArgs,
        reason: String,
    ) -> CommandOutcome {
        tracing::warn!(%event, reason = %reason, "connection to OMS lost");
        self.close_connection();
        self.pending_replay = Some((event, args.clone()));
        self.emit(DriverAsyncEvent::ConnectionLost {
            event,
            args,
            reason,
        });
        CommandOutcome::transition(Disconnected)
    }

    fn set_state(&mut self, state: DriverState) {
        if self.state != state {
            tracing::info!(from = %self.state, to = %state, "driver state change");
            self.state = state;
            self.emit(DriverAsyncEvent::StateChange { state });
        }
    }

    fn emit(&self, event: DriverAsyncEvent) {
        let _ = self.events.send(event);
    }

    async fn run_command(&mut self, handler: Handler, args: &CommandArgs) -> PlatformResult<Value> {
        match handler {
            Handler::Ping => Ok(json!(self.executor()?.ping().await?)),
            Handler::PollTelemetry => self.poll_telemetry().await,
            Handler::TurnOnPort => {
                let port_id = args.require_str("port_id", "turn_on_port")?;
                let src = args.require_str("src", "turn_on_port")?;
                self.executor()?.turn_on_port(port_id, src).await
            }
            Handler::TurnOffPort => {
                let port_id = args.require_str("port_id", "turn_off_port")?;
                let src = args.require_str("src", "turn_off_port")?;
                self.executor()?.turn_off_port(port_id, src).await
            }
            Handler::SetOverCurrent => {
                let op = "set_port_over_current_limits";
                let port_id = args.require_str("port_id", op)?;
                let milliamps = args.require_i64("milliamps", op)?;
                let microseconds = args.require_i64("microseconds", op)?;
                let src = args.require_str("src", op)?;
                self.executor()?
                    .set_overcurrent_limit(port_id, milliamps, microseconds, src)
                    .await
            }
            Handler::StartMission => {
                let op = "start_profiler_mission";
                let name = args.require_str("profile_mission_name", op)?;
                let src = args.require_str("src", op)?;
                self.executor()?.start_profiler_mission(name, src).await
            }
            Handler::StopMission => {
                let op = "stop_profiler_mission";
                let flag = args.require_str("flag", op)?;
                let src = args.require_str("src", op)?;
                self.executor()?.stop_profiler_mission(flag, src).await
            }
            Handler::MissionStatus => self.executor()?.get_mission_status().await,
            Handler::AvailableMissions => self.executor()?.get_available_missions().await,
            Handler::Configure | Handler::Connect | Handler::Disconnect => {
                Err(PlatformError::InvalidState {
                    state: self.state,
                    event: format!("{handler:?}"),
                })
            }
        }
    }

    async fn poll_telemetry(&mut self) -> PlatformResult<Value> {
        let node = Arc::clone(self.node_config()?);
        let executor = self
            .executor
            .as_ref()
            .ok_or_else(|| PlatformError::Configuration("driver is not configured".to_string()))?;

        let events = self.events.clone();
        let mut sink = move |sample: EmittedSample| {
            let _ = events.send(DriverAsyncEvent::Sample(sample));
        };
        let now = (self.clock)();
        let summary = self
            .poller
            .poll_cycle(executor, &node, now, &mut sink)
            .await?;

        tracing::debug!(emitted = summary.emitted, skipped = summary.skipped_streams.len(), "poll cycle complete");
        let result = json!({
            "emitted": summary.emitted,
            "skipped_streams": summary.skipped_streams,
        });
        self.emit(DriverAsyncEvent::PollCompleted {
            emitted: summary.emitted,
            skipped_streams: summary.skipped_streams,
        });
        Ok(result)
    }
}

#[async_trait]
impl Recoverable<PlatformError> for PlatformDriver {
    async fn recover(&mut self) -> Result<(), PlatformError> {
        self.open_connection().await
    }
}

impl Drop for PlatformDriver {
    fn drop(&mut self) {
        if let Some(task) = self.scheduler.take() {
            task.abort();
        }
    }
}

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{debug, error, info, warn};
use util::ring::{RingBuffer, RingConfig};
use util::state::{AppState, StateEvent, StateMachine};
use util::stats::RateStats;
use util::AcquisitionParams;

use crate::acquire::{Acquirer, StopHandler, StopReason};
use crate::commands::{CommandCodec, CommandKind, RenderParams};
use crate::error::{CommandError, UsbError};
use crate::events::{Event, EventBus};
use crate::process::{DataSink, Processor};
use crate::usb_endpoint::{UsbEndpoint, UsbSpeed};

const ARRIVAL_DEBOUNCE: Duration = Duration::from_millis(300);
const WORKER_JOIN_TIMEOUT: Duration = Duration::from_millis(300);

/// Lane/channel wiring overlaid onto every rendered command frame.
#[derive(Clone, Copy, Debug, Default)]
pub struct ChannelConfig {
    pub lane_seq: u8,
    pub channel_mode: u8,
    pub invert_pn: u8,
}

/// Returns true when this occurrence should be acted on, false when it is a
/// bounce within the debounce window of the previous one.
fn debounce(last: &mut Option<Instant>, window: Duration) -> bool {
    let now = Instant::now();
    match *last {
        Some(previous) if now.duration_since(previous) < window => false,
        _ => {
            *last = Some(now);
            true
        }
    }
}

/// Returns false when the thread had to be detached instead of joined.
fn join_bounded(handle: JoinHandle<()>, timeout: Duration, name: &str) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!("{name} did not exit within {timeout:?}, detaching");
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
    true
}

struct CoordinatorInner {
    self_weak: Weak<CoordinatorInner>,
    events: EventBus,
    state: Arc<StateMachine>,
    ring: Arc<RingBuffer>,
    stats: Arc<RateStats>,
    endpoint: Mutex<Option<Arc<UsbEndpoint>>>,
    codec: Mutex<Option<CommandCodec>>,
    channel: Mutex<ChannelConfig>,
    render_params: Mutex<Option<RenderParams>>,
    sinks: Mutex<Vec<Arc<dyn DataSink>>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    stopping: Mutex<Arc<AtomicBool>>,
    acquirer_handle: Mutex<Option<JoinHandle<()>>>,
    processor_handle: Mutex<Option<JoinHandle<()>>>,
    last_arrival: Mutex<Option<Instant>>,
    last_removal: Mutex<Option<Instant>>,
}

/// Composition root of the pipeline: owns the endpoint, codec, ring, rate
/// statistics and state machine, translates device and worker events into
/// state transitions, and manages the worker thread lifecycles.
pub struct DeviceCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl StopHandler for CoordinatorInner {
    fn request_stop(&self, reason: StopReason, message: &str) {
        if self.shutting_down.load(Ordering::Acquire) {
            debug!("stop escalation during shutdown dropped: {message}");
            return;
        }
        let Some(inner) = self.self_weak.upgrade() else {
            return;
        };
        // The escalation typically originates on the worker thread itself;
        // tearing down inline would self-join. Hand it to a one-shot task.
        let message = message.to_string();
        let spawned = std::thread::Builder::new()
            .name("stop-escalation".into())
            .spawn(move || inner.handle_failure(reason, &message));
        if let Err(e) = spawned {
            error!("failed to spawn stop escalation: {e}");
        }
    }
}

impl CoordinatorInner {
    fn publish(&self, event: Event) {
        if !self.shutting_down.load(Ordering::Acquire) {
            self.events.publish(event);
        }
    }

    fn handle_failure(&self, reason: StopReason, message: &str) {
        error!("acquisition failure: {message}");
        self.publish(Event::AcquisitionError(message.to_string()));
        self.stop_workers(true);
        self.state.dispatch(StateEvent::ErrorOccurred, reason.describe());
        self.publish(Event::AcquisitionStopped);
    }

    /// Signal the workers, trigger the asynchronous endpoint teardown and
    /// join both threads with a bounded wait. Returns false when the
    /// teardown was not clean: the cleanup task could not be spawned or a
    /// worker had to be detached.
    fn stop_workers(&self, send_stop_command: bool) -> bool {
        if !self.running.swap(false, Ordering::AcqRel) {
            return true;
        }

        self.stopping.lock().unwrap().store(true, Ordering::Release);
        self.ring.notify();

        let mut clean = true;

        let endpoint = self.endpoint.lock().unwrap().clone();
        if let Some(endpoint) = endpoint {
            let stop_frame = if send_stop_command {
                let codec = self.codec.lock().unwrap();
                let render_params = self.render_params.lock().unwrap();
                match (codec.as_ref(), render_params.as_ref()) {
                    (Some(codec), Some(params)) => Some(codec.render(CommandKind::End, params)),
                    _ => None,
                }
            } else {
                None
            };
            clean &= endpoint.stop_transfer(stop_frame);
        }

        if let Some(handle) = self.acquirer_handle.lock().unwrap().take() {
            clean &= join_bounded(handle, WORKER_JOIN_TIMEOUT, "acquirer");
        }
        if let Some(handle) = self.processor_handle.lock().unwrap().take() {
            clean &= join_bounded(handle, WORKER_JOIN_TIMEOUT, "processor");
        }

        clean
    }
}

impl DeviceCoordinator {
    pub fn new(events: EventBus) -> Self {
        Self::with_ring_config(events, RingConfig::default())
    }

    pub fn with_ring_config(events: EventBus, ring_config: RingConfig) -> Self {
        let state = Arc::new(StateMachine::default());

        let inner = Arc::new_cyclic(|self_weak| CoordinatorInner {
            self_weak: self_weak.clone(),
            events: events.clone(),
            state: Arc::clone(&state),
            ring: Arc::new(RingBuffer::new(ring_config)),
            stats: Arc::new(RateStats::new()),
            endpoint: Mutex::new(None),
            codec: Mutex::new(None),
            channel: Mutex::new(ChannelConfig::default()),
            render_params: Mutex::new(None),
            sinks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            stopping: Mutex::new(Arc::new(AtomicBool::new(false))),
            acquirer_handle: Mutex::new(None),
            processor_handle: Mutex::new(None),
            last_arrival: Mutex::new(None),
            last_removal: Mutex::new(None),
        });

        // Every state transition is republished on the event bus; once
        // shutdown has begun the subscriber side must stay quiet.
        let observer_inner = Arc::downgrade(&inner);
        state.subscribe(Arc::new(move |old, new, reason| {
            if let Some(inner) = observer_inner.upgrade() {
                inner.publish(Event::StateChanged {
                    old,
                    new,
                    reason: reason.to_string(),
                });
            }
        }));

        DeviceCoordinator { inner }
    }

    pub fn state(&self) -> AppState {
        self.inner.state.current()
    }

    pub fn state_machine(&self) -> Arc<StateMachine> {
        Arc::clone(&self.inner.state)
    }

    pub fn ring(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.inner.ring)
    }

    pub fn stats(&self) -> Arc<RateStats> {
        Arc::clone(&self.inner.stats)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn usb_speed(&self) -> Option<UsbSpeed> {
        self.inner
            .endpoint
            .lock()
            .unwrap()
            .as_ref()
            .map(|endpoint| endpoint.usb_speed())
    }

    /// Register a data consumer. Sinks must be in place before
    /// [`start_transfer`](Self::start_transfer).
    pub fn add_sink(&self, sink: Arc<dyn DataSink>) {
        self.inner.sinks.lock().unwrap().push(sink);
    }

    /// Set the lane/channel overlay used by subsequent command frames.
    pub fn set_channel_config(&self, channel: ChannelConfig) {
        *self.inner.channel.lock().unwrap() = channel;
    }

    /// Debounced device-arrival handling: open, validate, publish.
    pub fn on_device_arrival(&self) {
        if !debounce(&mut self.inner.last_arrival.lock().unwrap(), ARRIVAL_DEBOUNCE) {
            debug!("device arrival ignored by debounce");
            return;
        }

        match UsbEndpoint::open() {
            Ok(endpoint) => {
                info!("device arrived, speed {:?}", endpoint.usb_speed());
                *self.inner.endpoint.lock().unwrap() = Some(endpoint);
                self.inner
                    .state
                    .dispatch(StateEvent::DeviceConnected, "device arrived");
            }
            Err(e) => {
                error!("device arrival but open failed: {e}");
                self.inner.publish(Event::AcquisitionError(format!("open failed: {e}")));
                self.inner
                    .state
                    .dispatch(StateEvent::ErrorOccurred, "open failed");
            }
        }
    }

    /// Debounced removal handling: force-stop, drop the endpoint, publish.
    pub fn on_device_removal(&self) {
        if !debounce(&mut self.inner.last_removal.lock().unwrap(), ARRIVAL_DEBOUNCE) {
            debug!("device removal ignored by debounce");
            return;
        }

        info!("device removed");
        self.inner.stop_workers(false);
        *self.inner.endpoint.lock().unwrap() = None;
        self.inner
            .state
            .dispatch(StateEvent::DeviceDisconnected, "device removed");
        self.inner.publish(Event::AcquisitionStopped);
    }

    /// Load and validate command templates, moving to `Configured`.
    pub fn load_commands(&self, dir: &Path) -> anyhow::Result<()> {
        match CommandCodec::load_from_dir(dir) {
            Ok(codec) => {
                *self.inner.codec.lock().unwrap() = Some(codec);
                self.inner
                    .state
                    .dispatch(StateEvent::CommandsLoaded, "commands loaded");
                Ok(())
            }
            Err(e) => {
                self.inner
                    .publish(Event::AcquisitionError(format!("command load failed: {e}")));
                Err(e).context("loading command templates")
            }
        }
    }

    pub fn unload_commands(&self) {
        *self.inner.codec.lock().unwrap() = None;
        self.inner
            .state
            .dispatch(StateEvent::CommandsUnloaded, "commands unloaded");
    }

    /// Validate, send the configuration commands, and bring up the worker
    /// pair. Rewinds on any failure.
    pub fn start_transfer(&self, width: u16, height: u16, format_code: u8) -> anyhow::Result<()> {
        // Parameter validation happens before any state is touched; a bad
        // request leaves the machine in Configured.
        let params = AcquisitionParams::new(width, height, format_code).map_err(|e| {
            self.inner
                .publish(Event::AcquisitionError(format!("invalid parameters: {e}")));
            anyhow::anyhow!(e)
        })?;

        if self
            .inner
            .state
            .dispatch(StateEvent::StartRequested, "start requested")
            .is_none()
        {
            bail!("start not allowed in state {}", self.state());
        }

        match self.start_workers(params) {
            Ok(()) => {
                self.inner
                    .state
                    .dispatch(StateEvent::StartSucceeded, "transfer running");
                self.inner.publish(Event::AcquisitionStarted);
                Ok(())
            }
            Err(e) => {
                error!("start failed: {e:#}");
                self.inner.stop_workers(false);
                self.inner
                    .publish(Event::AcquisitionError(format!("start failed: {e:#}")));
                self.inner
                    .state
                    .dispatch(StateEvent::StartFailed, "start failed");
                Err(e)
            }
        }
    }

    fn start_workers(&self, params: AcquisitionParams) -> anyhow::Result<()> {
        let endpoint = self
            .inner
            .endpoint
            .lock()
            .unwrap()
            .clone()
            .ok_or(UsbError::NotOpen)?;

        let render = {
            let codec = self.inner.codec.lock().unwrap();
            let codec = codec.as_ref().ok_or(CommandError::NotLoaded)?;
            let channel = *self.inner.channel.lock().unwrap();
            let mut render = RenderParams::new(params);
            render.lane_seq = channel.lane_seq;
            render.channel_mode = channel.channel_mode;
            render.invert_pn = channel.invert_pn;
            endpoint
                .send_command_frame(&codec.render(CommandKind::FrameSize, &render))
                .context("sending frame-size command")?;
            endpoint
                .send_command_frame(&codec.render(CommandKind::Start, &render))
                .context("sending start command")?;
            render
        };
        *self.inner.render_params.lock().unwrap() = Some(render);

        self.inner.ring.reset();
        self.inner.stats.reset();

        let stopping = Arc::new(AtomicBool::new(false));
        *self.inner.stopping.lock().unwrap() = Arc::clone(&stopping);
        endpoint.set_transferring(true);

        let stop_handler: Weak<dyn StopHandler> = self.inner.self_weak.clone();

        // The acquirer deliberately holds the endpoint weakly: a vanishing
        // device must not be kept alive by a still-running reader.
        let acquirer = Acquirer {
            endpoint: Arc::downgrade(&endpoint),
            ring: Arc::clone(&self.inner.ring),
            stats: Arc::clone(&self.inner.stats),
            events: self.inner.events.clone(),
            stop_handler,
            stopping: Arc::clone(&stopping),
        };

        let processor = Processor {
            ring: Arc::clone(&self.inner.ring),
            sinks: self.inner.sinks.lock().unwrap().clone(),
            events: self.inner.events.clone(),
            stopping,
        };

        *self.inner.acquirer_handle.lock().unwrap() = Some(acquirer.spawn());
        *self.inner.processor_handle.lock().unwrap() = Some(processor.spawn());
        self.inner.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Orderly stop: publish, tear down the endpoint asynchronously, join
    /// the workers with a bounded wait. A teardown that leaves detached
    /// workers or never ran the endpoint cleanup is a stop failure.
    pub fn stop_transfer(&self) -> anyhow::Result<()> {
        if self
            .inner
            .state
            .dispatch(StateEvent::StopRequested, "stop requested")
            .is_none()
        {
            bail!("stop not allowed in state {}", self.state());
        }

        if !self.inner.stop_workers(true) {
            self.inner
                .publish(Event::AcquisitionError("stop did not complete cleanly".into()));
            self.inner
                .state
                .dispatch(StateEvent::StopFailed, "stop did not complete cleanly");
            self.inner.publish(Event::AcquisitionStopped);
            bail!("stop did not complete cleanly");
        }

        self.inner
            .state
            .dispatch(StateEvent::StopSucceeded, "transfer stopped");
        self.inner.publish(Event::AcquisitionStopped);
        Ok(())
    }

    /// Flag the shutdown, silence UI publication, stop everything.
    pub fn prepare_for_shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::Release);
        self.inner.state.dispatch(StateEvent::AppShutdown, "application shutdown");
        self.inner.stop_workers(true);
        *self.inner.endpoint.lock().unwrap() = None;
    }
}

impl Drop for DeviceCoordinator {
    fn drop(&mut self) {
        self.inner.stop_workers(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debounce_suppresses_bounces() {
        let mut last = None;
        let window = Duration::from_millis(300);
        assert!(debounce(&mut last, window));
        assert!(!debounce(&mut last, window));

        // Outside the window the next occurrence passes again.
        let mut old = Some(Instant::now() - Duration::from_millis(400));
        assert!(debounce(&mut old, window));
    }

    #[test]
    fn invalid_params_leave_state_untouched() {
        let events = EventBus::new();
        let coordinator = DeviceCoordinator::new(events.clone());
        let machine = coordinator.state_machine();
        machine.dispatch(StateEvent::DeviceConnected, "test");
        machine.dispatch(StateEvent::CommandsLoaded, "test");
        assert_eq!(coordinator.state(), AppState::Configured);

        assert!(coordinator.start_transfer(0, 1080, 0x39).is_err());
        assert_eq!(coordinator.state(), AppState::Configured);

        assert!(coordinator.start_transfer(1920, 1080, 0x55).is_err());
        assert_eq!(coordinator.state(), AppState::Configured);
        events.shutdown();
    }

    #[test]
    fn start_without_device_fails_into_device_error() {
        let events = EventBus::new();
        let coordinator = DeviceCoordinator::new(events.clone());
        let machine = coordinator.state_machine();
        machine.dispatch(StateEvent::DeviceConnected, "test");
        machine.dispatch(StateEvent::CommandsLoaded, "test");

        assert!(coordinator.start_transfer(1920, 1080, 0x39).is_err());
        assert_eq!(coordinator.state(), AppState::DeviceError);
        events.shutdown();
    }

    #[test]
    fn stop_requires_transferring() {
        let events = EventBus::new();
        let coordinator = DeviceCoordinator::new(events.clone());
        assert!(coordinator.stop_transfer().is_err());
        events.shutdown();
    }

    #[test]
    fn shutdown_reaches_absorbing_state() {
        let events = EventBus::new();
        let coordinator = DeviceCoordinator::new(events.clone());
        coordinator.prepare_for_shutdown();
        assert_eq!(coordinator.state(), AppState::Shutdown);

        // Events after shutdown are suppressed at the coordinator level.
        coordinator.inner.publish(Event::AcquisitionStarted);
        events.shutdown();
    }
}

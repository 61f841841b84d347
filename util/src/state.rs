use std::fmt;
use std::sync::{Arc, Mutex};

/// Global application lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppState {
    Initializing,
    DeviceAbsent,
    DeviceError,
    Idle,
    CommandsMissing,
    Configured,
    Starting,
    Transferring,
    Stopping,
    Shutdown,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppState::Initializing => "initializing",
            AppState::DeviceAbsent => "device-absent",
            AppState::DeviceError => "device-error",
            AppState::Idle => "idle",
            AppState::CommandsMissing => "commands-missing",
            AppState::Configured => "configured",
            AppState::Starting => "starting",
            AppState::Transferring => "transferring",
            AppState::Stopping => "stopping",
            AppState::Shutdown => "shutdown",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StateEvent {
    AppInit,
    DeviceConnected,
    DeviceDisconnected,
    ErrorOccurred,
    CommandsLoaded,
    CommandsUnloaded,
    StartRequested,
    StartSucceeded,
    StartFailed,
    StopRequested,
    StopSucceeded,
    StopFailed,
    AppShutdown,
}

/// The closed transition table. Events that do not match the current state
/// yield `None` and are ignored by the machine.
pub fn transition(state: AppState, event: StateEvent) -> Option<AppState> {
    use AppState::*;
    use StateEvent::*;

    if event == AppShutdown {
        return if state == Shutdown { None } else { Some(Shutdown) };
    }

    match (state, event) {
        (Initializing, DeviceConnected) => Some(CommandsMissing),
        (Initializing, ErrorOccurred) => Some(DeviceError),

        (DeviceAbsent, DeviceConnected) => Some(CommandsMissing),

        (DeviceError, DeviceConnected) => Some(CommandsMissing),
        (DeviceError, DeviceDisconnected) => Some(DeviceAbsent),

        (CommandsMissing, CommandsLoaded) => Some(Configured),
        (CommandsMissing, DeviceDisconnected) => Some(DeviceAbsent),
        (CommandsMissing, ErrorOccurred) => Some(DeviceError),

        (Configured, StartRequested) => Some(Starting),
        (Configured, CommandsUnloaded) => Some(CommandsMissing),
        (Configured, DeviceDisconnected) => Some(DeviceAbsent),
        (Configured, ErrorOccurred) => Some(DeviceError),

        (Starting, StartSucceeded) => Some(Transferring),
        (Starting, StartFailed) => Some(DeviceError),
        (Starting, DeviceDisconnected) => Some(DeviceAbsent),
        (Starting, ErrorOccurred) => Some(DeviceError),

        (Transferring, StopRequested) => Some(Stopping),
        (Transferring, DeviceDisconnected) => Some(DeviceAbsent),
        (Transferring, ErrorOccurred) => Some(DeviceError),

        (Stopping, StopSucceeded) => Some(Configured),
        (Stopping, StopFailed) => Some(DeviceError),
        (Stopping, DeviceDisconnected) => Some(DeviceAbsent),
        (Stopping, ErrorOccurred) => Some(DeviceError),

        _ => None,
    }
}

pub type TransitionObserver = Arc<dyn Fn(AppState, AppState, &str) + Send + Sync>;

/// Lifecycle state plus ordered transition publication.
///
/// The subscriber list is copy-on-write: dispatch walks a snapshot without
/// holding the list lock, and the transition mutex is never held while
/// observers run. A dedicated publish lock keeps notifications in the order
/// the transitions occurred.
pub struct StateMachine {
    state: Mutex<AppState>,
    publish: Mutex<()>,
    observers: Mutex<Arc<Vec<TransitionObserver>>>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new(AppState::Initializing)
    }
}

impl StateMachine {
    pub fn new(initial: AppState) -> Self {
        StateMachine {
            state: Mutex::new(initial),
            publish: Mutex::new(()),
            observers: Mutex::new(Arc::new(Vec::new())),
        }
    }

    pub fn current(&self) -> AppState {
        *self.state.lock().unwrap()
    }

    pub fn subscribe(&self, observer: TransitionObserver) {
        let mut list = self.observers.lock().unwrap();
        let mut next = Vec::clone(&list);
        next.push(observer);
        *list = Arc::new(next);
    }

    /// Apply `event`; returns the `(old, new)` pair when a transition fired
    /// and `None` when the event was ignored in the current state.
    pub fn dispatch(&self, event: StateEvent, reason: &str) -> Option<(AppState, AppState)> {
        let _order = self.publish.lock().unwrap();

        let (old, new) = {
            let mut state = self.state.lock().unwrap();
            let old = *state;
            let new = transition(old, event)?;
            *state = new;
            (old, new)
        };

        let observers = Arc::clone(&self.observers.lock().unwrap());
        for observer in observers.iter() {
            observer(old, new, reason);
        }

        Some((old, new))
    }
}

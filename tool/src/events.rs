use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Sender};
use log::{debug, warn};
use util::packet::{DataPacket, DataPacketBatch};
use util::state::AppState;

use crate::file::{SaveStatistics, SaveStatus};

/// Everything the pipeline publishes. The UI is one subscriber; data
/// consumers and tests are others.
#[derive(Clone, Debug)]
pub enum Event {
    AcquisitionStarted,
    AcquisitionStopped,
    AcquisitionError(String),
    DataReceived(DataPacket),
    BatchDataReceived(DataPacketBatch),
    StatsUpdated {
        total_bytes: u64,
        rate_mbps: f64,
        elapsed_ms: u64,
    },
    StateChanged {
        old: AppState,
        new: AppState,
        reason: String,
    },
    SaveStatusChanged(SaveStatus),
    SaveProgressUpdated(SaveStatistics),
    SaveCompleted {
        path: PathBuf,
        total_bytes: u64,
    },
    SaveError(String),
    LoadStarted {
        path: PathBuf,
        total_bytes: u64,
    },
    LoadProgress {
        percent: u8,
        bytes_read: u64,
    },
    LoadCompleted {
        path: PathBuf,
        total_bytes: u64,
    },
    LoadError(String),
    NewDataAvailable {
        queued_packets: usize,
    },
    DataReadCompleted {
        data: Arc<[u8]>,
        offset: u64,
        request_id: u64,
    },
    DataReadError {
        message: String,
        request_id: u64,
    },
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

enum BusMessage {
    Publish(Event),
    Shutdown,
}

struct BusInner {
    subscribers: Mutex<Arc<Vec<Subscriber>>>,
    muted: AtomicBool,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Ordered event fan-out: publishers enqueue, a single dispatcher thread
/// invokes every subscriber in publication order. The emitter never learns
/// who is listening.
#[derive(Clone)]
pub struct EventBus {
    tx: Sender<BusMessage>,
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        let inner = Arc::new(BusInner {
            subscribers: Mutex::new(Arc::new(Vec::new())),
            muted: AtomicBool::new(false),
            dispatcher: Mutex::new(None),
        });

        let dispatch_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("event-bus".into())
            .spawn(move || {
                while let Ok(message) = rx.recv() {
                    match message {
                        BusMessage::Publish(event) => {
                            let subscribers =
                                Arc::clone(&dispatch_inner.subscribers.lock().unwrap());
                            for subscriber in subscribers.iter() {
                                subscriber(&event);
                            }
                        }
                        BusMessage::Shutdown => break,
                    }
                }
            })
            .expect("spawn event dispatcher");

        *inner.dispatcher.lock().unwrap() = Some(handle);

        EventBus { tx, inner }
    }

    pub fn subscribe(&self, subscriber: Subscriber) {
        let mut list = self.inner.subscribers.lock().unwrap();
        let mut next = Vec::clone(&list);
        next.push(subscriber);
        *list = Arc::new(next);
    }

    /// Enqueue an event for dispatch. Once the bus is muted (shutdown in
    /// progress) events are dropped instead of delivered.
    pub fn publish(&self, event: Event) {
        if self.inner.muted.load(Ordering::Acquire) {
            debug!("event dropped during shutdown");
            return;
        }
        if self.tx.send(BusMessage::Publish(event)).is_err() {
            warn!("event bus dispatcher is gone");
        }
    }

    /// Stop delivering events. Pending events already queued are still
    /// dispatched before the dispatcher exits.
    pub fn shutdown(&self) {
        self.inner.muted.store(true, Ordering::Release);
        let _ = self.tx.send(BusMessage::Shutdown);
        if let Some(handle) = self.inner.dispatcher.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn wait_for(counter: &AtomicUsize, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!(
            "expected {expected} events, saw {}",
            counter.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn delivers_in_publication_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let seen2 = Arc::clone(&seen);
        let count2 = Arc::clone(&count);
        bus.subscribe(Arc::new(move |event| {
            if let Event::StatsUpdated { total_bytes, .. } = event {
                seen2.lock().unwrap().push(*total_bytes);
                count2.fetch_add(1, Ordering::SeqCst);
            }
        }));

        for total_bytes in 0..10u64 {
            bus.publish(Event::StatsUpdated {
                total_bytes,
                rate_mbps: 0.0,
                elapsed_ms: 0,
            });
        }

        wait_for(&count, 10);
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<u64>>());
        bus.shutdown();
    }

    #[test]
    fn muted_bus_drops_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        bus.subscribe(Arc::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        }));

        bus.shutdown();
        bus.publish(Event::AcquisitionStarted);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}

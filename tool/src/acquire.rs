use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use util::ring::{OccupancyLevel, RingBuffer};
use util::stats::RateStats;

use crate::events::{Event, EventBus};
use crate::usb_endpoint::UsbEndpoint;

pub const STOP_CHECK_INTERVAL_MS: u64 = 100;
pub const STATS_UPDATE_INTERVAL_MS: u64 = 200;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

const READ_TIMEOUT: Duration = Duration::from_millis(1000);
const FAILURE_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    UserRequest,
    BufferOverflow,
    ReadError,
    DeviceError,
    DeviceRemoved,
}

impl StopReason {
    pub fn describe(self) -> &'static str {
        match self {
            StopReason::UserRequest => "stop requested",
            StopReason::BufferOverflow => "buffer overflow, downstream too slow",
            StopReason::ReadError => "too many consecutive read failures",
            StopReason::DeviceError => "device error",
            StopReason::DeviceRemoved => "device removed",
        }
    }
}

/// Receiver of stop escalations from the worker loops. The coordinator
/// implements this; workers hold it weakly so a torn-down coordinator
/// simply ignores late escalations.
pub trait StopHandler: Send + Sync {
    fn request_stop(&self, reason: StopReason, message: &str);
}

/// Producer side of the pipeline: pulls write slots from the ring and fills
/// them from the bulk-in endpoint.
pub struct Acquirer {
    pub endpoint: Weak<UsbEndpoint>,
    pub ring: Arc<RingBuffer>,
    pub stats: Arc<RateStats>,
    pub events: EventBus,
    pub stop_handler: Weak<dyn StopHandler>,
    pub stopping: Arc<AtomicBool>,
}

impl Acquirer {
    pub fn spawn(self) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name("acquirer".into())
            .spawn(move || {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| self.run()));
                if result.is_err() {
                    error!("acquisition loop panicked");
                    if let Some(handler) = self.stop_handler.upgrade() {
                        handler.request_stop(StopReason::DeviceError, "acquisition loop panicked");
                    }
                }
                info!("acquisition thread stopped");
            })
            .expect("spawn acquirer thread")
    }

    fn escalate(&self, reason: StopReason, message: &str) {
        match self.stop_handler.upgrade() {
            Some(handler) => handler.request_stop(reason, message),
            None => warn!("stop escalation dropped, coordinator gone: {message}"),
        }
    }

    fn run(&self) {
        info!("acquisition thread started");
        let mut consecutive_failures = 0u32;
        let mut last_stats_update = Instant::now();

        loop {
            if self.stopping.load(Ordering::Acquire) {
                break;
            }

            if self.ring.occupancy_level() == OccupancyLevel::Critical {
                error!("ring buffer critical, requesting stop");
                self.escalate(StopReason::BufferOverflow, StopReason::BufferOverflow.describe());
                break;
            }

            let Some(endpoint) = self.endpoint.upgrade() else {
                self.escalate(StopReason::DeviceError, "usb endpoint released");
                break;
            };

            let mut slot = self.ring.write_slot();
            let read_result = endpoint.read_into(slot.buf(), READ_TIMEOUT);
            drop(endpoint);

            match read_result {
                Ok(bytes_read) if bytes_read > 0 => {
                    consecutive_failures = 0;

                    if let Err(e) = self.ring.commit(slot, bytes_read) {
                        warn!("commit rejected: {e}");
                        continue;
                    }
                    self.stats.add_bytes(bytes_read as u64);

                    if last_stats_update.elapsed().as_millis() as u64 >= STATS_UPDATE_INTERVAL_MS {
                        self.events.publish(Event::StatsUpdated {
                            total_bytes: self.stats.total_bytes(),
                            rate_mbps: self.stats.rate_mb_per_sec(),
                            elapsed_ms: self.stats.elapsed_ms(),
                        });
                        last_stats_update = Instant::now();
                    }
                }
                other => {
                    drop(slot);
                    consecutive_failures += 1;
                    match other {
                        Ok(_) => warn!(
                            "empty bulk read (attempt {consecutive_failures}/{MAX_CONSECUTIVE_FAILURES})"
                        ),
                        Err(e) => warn!(
                            "bulk read failed: {e} (attempt {consecutive_failures}/{MAX_CONSECUTIVE_FAILURES})"
                        ),
                    }

                    if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                        self.escalate(StopReason::ReadError, StopReason::ReadError.describe());
                        break;
                    }
                    std::thread::sleep(FAILURE_BACKOFF);
                }
            }

            std::thread::yield_now();
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use rusb::{Context, DeviceHandle};

use crate::error::UsbError;
use crate::usb_device::{open_device, OpenedDevice};

pub const COMMAND_FRAME_LEN: usize = 512;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(1000);
const COMMAND_TIMEOUT: Duration = Duration::from_millis(500);
const COMMAND_SETTLE: Duration = Duration::from_millis(12);
const CLEANUP_STEP_TIMEOUT: Duration = Duration::from_millis(200);
const CLEANUP_CEILING: Duration = Duration::from_millis(500);
const DRAIN_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbSpeed {
    LowSpeed,
    FullSpeed,
    HighSpeed,
    SuperSpeed,
    SuperSpeedPlus,
    Unknown,
}

impl From<rusb::Speed> for UsbSpeed {
    fn from(speed: rusb::Speed) -> Self {
        match speed {
            rusb::Speed::Low => UsbSpeed::LowSpeed,
            rusb::Speed::Full => UsbSpeed::FullSpeed,
            rusb::Speed::High => UsbSpeed::HighSpeed,
            rusb::Speed::Super => UsbSpeed::SuperSpeed,
            rusb::Speed::SuperPlus => UsbSpeed::SuperSpeedPlus,
            _ => UsbSpeed::Unknown,
        }
    }
}

/// The vendor bulk endpoint pair of one opened FX3.
///
/// Reads and command writes are synchronous with per-call timeouts. The
/// teardown in [`stop_transfer`](Self::stop_transfer) is asymmetric on
/// purpose: the transferring flag flips synchronously while the hardware
/// cleanup runs on a detached, time-bounded thread so a wedged endpoint
/// reset can never block the caller.
pub struct UsbEndpoint {
    handle: DeviceHandle<Context>,
    endpoint_in: u8,
    endpoint_out: u8,
    speed: UsbSpeed,
    transferring: AtomicBool,
}

impl UsbEndpoint {
    /// Enumerate, open and validate the FX3 (3 attempts, 500 ms backoff).
    pub fn open() -> Result<Arc<Self>, UsbError> {
        let OpenedDevice {
            handle,
            endpoint_in,
            endpoint_out,
            speed,
        } = open_device()?;

        let endpoint = Arc::new(UsbEndpoint {
            handle,
            endpoint_in,
            endpoint_out,
            speed: speed.into(),
            transferring: AtomicBool::new(false),
        });

        // An aborted previous session can leave stale payload in the IN
        // endpoint. Must be removed before commands are exchanged.
        endpoint.drain_residual();

        Ok(endpoint)
    }

    pub fn usb_speed(&self) -> UsbSpeed {
        self.speed
    }

    pub fn is_transferring(&self) -> bool {
        self.transferring.load(Ordering::Acquire)
    }

    pub fn set_transferring(&self, on: bool) {
        self.transferring.store(on, Ordering::Release);
    }

    /// One bulk-in transfer into `buf`.
    pub fn read_into(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, UsbError> {
        self.handle
            .read_bulk(self.endpoint_in, buf, timeout)
            .map_err(UsbError::Transfer)
    }

    pub fn read(&self, buf: &mut [u8]) -> Result<usize, UsbError> {
        self.read_into(buf, DEFAULT_READ_TIMEOUT)
    }

    /// Send one 512-byte command frame. The IN endpoint is aborted first and
    /// the device given a short settle window; partial writes are rejected.
    pub fn send_command_frame(&self, frame: &[u8; COMMAND_FRAME_LEN]) -> Result<(), UsbError> {
        if let Err(e) = self.handle.clear_halt(self.endpoint_in) {
            debug!("pre-command abort of IN endpoint failed: {e}");
        }
        std::thread::sleep(COMMAND_SETTLE);

        let written = self
            .handle
            .write_bulk(self.endpoint_out, frame, COMMAND_TIMEOUT)
            .map_err(UsbError::Transfer)?;

        if written != COMMAND_FRAME_LEN {
            return Err(UsbError::ShortCommandWrite {
                sent: written,
                expected: COMMAND_FRAME_LEN,
            });
        }
        Ok(())
    }

    /// Flip the transferring flag and tear the endpoints down in the
    /// background. Returns immediately; the cleanup thread sends the stop
    /// command best-effort, then aborts and resets both endpoints, all
    /// under a 500 ms ceiling. Returns false when the cleanup task could
    /// not be spawned, meaning the hardware teardown never ran.
    pub fn stop_transfer(
        self: Arc<Self>,
        stop_frame: Option<Box<[u8; COMMAND_FRAME_LEN]>>,
    ) -> bool {
        self.set_transferring(false);

        let endpoint = self;
        let spawned = std::thread::Builder::new()
            .name("usb-cleanup".into())
            .spawn(move || {
                let started = Instant::now();

                if let Some(frame) = stop_frame {
                    match endpoint
                        .handle
                        .write_bulk(endpoint.endpoint_out, &frame[..], CLEANUP_STEP_TIMEOUT)
                    {
                        Ok(_) => debug!("stop command sent"),
                        Err(e) => warn!("stop command not delivered: {e}"),
                    }
                }

                if started.elapsed() < CLEANUP_CEILING {
                    if let Err(e) = endpoint.handle.clear_halt(endpoint.endpoint_in) {
                        warn!("abort of IN endpoint failed: {e}");
                    }
                }
                if started.elapsed() < CLEANUP_CEILING {
                    if let Err(e) = endpoint.handle.clear_halt(endpoint.endpoint_out) {
                        warn!("reset of OUT endpoint failed: {e}");
                    }
                }

                info!("usb cleanup finished after {:?}", started.elapsed());
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                warn!("failed to spawn usb cleanup thread: {e}");
                false
            }
        }
    }

    /// Drop whatever the IN endpoint still buffers from a previous run.
    pub fn drain_residual(&self) {
        let mut buf = [0u8; 1024];
        loop {
            match self.handle.read_bulk(self.endpoint_in, &mut buf, DRAIN_TIMEOUT) {
                Ok(0) | Err(_) => return,
                Ok(size) => debug!("cleared residual usb buffer of size {size}"),
            }
        }
    }
}

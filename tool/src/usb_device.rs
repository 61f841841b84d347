use std::time::Duration;

use log::{info, warn};
use rusb::{Context, Device, DeviceHandle, Direction, TransferType, UsbContext};
use util::{USB_PID, USB_VID};

use crate::error::UsbError;

const OPEN_ATTEMPTS: u32 = 3;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(500);

pub struct OpenedDevice {
    pub handle: DeviceHandle<Context>,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    pub speed: rusb::Speed,
}

fn find_device<T: UsbContext>(
    context: &mut T,
    vid: u16,
    pid: u16,
) -> Result<(Device<T>, DeviceHandle<T>), UsbError> {
    let devices = context.devices().map_err(UsbError::OpenFailed)?;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => {
                continue;
            }
        };

        if descriptor.vendor_id() == vid && descriptor.product_id() == pid {
            return match device.open() {
                Ok(handle) => Ok((device, handle)),
                Err(e) => Err(UsbError::OpenFailed(e)),
            };
        }
    }

    Err(UsbError::NoDevice { vid, pid })
}

/// Walk alt-interface 0 and locate the single bulk-IN / bulk-OUT pair.
fn locate_bulk_endpoints<T: UsbContext>(device: &Device<T>) -> Result<(u8, u8), UsbError> {
    let config = device
        .config_descriptor(0)
        .map_err(|e| UsbError::ValidationFailed(format!("no config descriptor: {e}")))?;

    let mut bulk_in = Vec::new();
    let mut bulk_out = Vec::new();

    for interface in config.interfaces() {
        for interface_desc in interface.descriptors() {
            if interface_desc.setting_number() != 0 {
                continue;
            }
            for endpoint in interface_desc.endpoint_descriptors() {
                if endpoint.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match endpoint.direction() {
                    Direction::In => bulk_in.push(endpoint.address()),
                    Direction::Out => bulk_out.push(endpoint.address()),
                }
            }
        }
    }

    match (bulk_in.as_slice(), bulk_out.as_slice()) {
        ([input], [output]) => Ok((*input, *output)),
        ([], _) | (_, []) => Err(UsbError::EndpointsMissing),
        _ => Err(UsbError::ValidationFailed(format!(
            "expected one bulk pair, found {} in / {} out",
            bulk_in.len(),
            bulk_out.len()
        ))),
    }
}

fn transient(error: &UsbError) -> bool {
    matches!(
        error,
        UsbError::NoDevice { .. }
            | UsbError::OpenFailed(rusb::Error::Busy)
            | UsbError::OpenFailed(rusb::Error::Io)
    )
}

/// Enumerate and open the FX3, re-enumerating on transient failure.
pub fn open_device() -> Result<OpenedDevice, UsbError> {
    open_device_with_ids(USB_VID, USB_PID)
}

pub fn open_device_with_ids(vid: u16, pid: u16) -> Result<OpenedDevice, UsbError> {
    let mut last_error = UsbError::NoDevice { vid, pid };

    for attempt in 1..=OPEN_ATTEMPTS {
        let mut context = match Context::new() {
            Ok(c) => c,
            Err(e) => {
                last_error = UsbError::OpenFailed(e);
                std::thread::sleep(OPEN_RETRY_DELAY);
                continue;
            }
        };

        match find_device(&mut context, vid, pid) {
            Ok((device, handle)) => {
                // Optional on Linux but required on Windows.
                if let Err(e) = handle.claim_interface(0) {
                    return Err(UsbError::OpenFailed(e));
                }

                let (endpoint_in, endpoint_out) = locate_bulk_endpoints(&device)?;
                let speed = device.speed();

                info!(
                    "opened FX3 {vid:04x}:{pid:04x}, bulk in 0x{endpoint_in:02x} out 0x{endpoint_out:02x}, speed {speed:?}"
                );

                return Ok(OpenedDevice {
                    handle,
                    endpoint_in,
                    endpoint_out,
                    speed,
                });
            }
            Err(error) => {
                if transient(&error) && attempt < OPEN_ATTEMPTS {
                    warn!("open attempt {attempt}/{OPEN_ATTEMPTS} failed: {error}");
                    last_error = error;
                    std::thread::sleep(OPEN_RETRY_DELAY);
                } else {
                    return Err(error);
                }
            }
        }
    }

    Err(last_error)
}

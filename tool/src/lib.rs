pub mod acquire;
pub mod commands;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod file;
pub mod process;
pub mod settings;
pub mod usb_device;
pub mod usb_endpoint;

pub use coordinator::DeviceCoordinator;
pub use events::{Event, EventBus};
pub use file::FileManager;

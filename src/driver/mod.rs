//! Driver Adapter: accepts the three scrcpy sockets for one device, decodes
//! the wire framing, and drives the reverse-tunnel lifecycle over ADB.

pub mod scrcpy;
pub mod transport;
pub mod wire;

pub use scrcpy::ScrcpyDriver;
pub use transport::{AdbTransport, DeviceTransport};
pub use wire::{DeviceControlMessage, DeviceFrame};

//! Device channel: acquisition, exclusive access, and a simulated controller.
//!
//! - [`gate::ChannelGate`] is the only owner of the channel handle
//! - [`serial`] finds and opens the controller's USB serial port
//! - [`simulator`] provides an in-memory controller for tests and `--simulate`

pub mod gate;
pub mod serial;
pub mod simulator;

pub use gate::{ChannelConnector, ChannelGate, DEFAULT_READ_TIMEOUT};
pub use serial::{DynSerial, PortLocator, SerialConnector, SerialPortIO};
pub use simulator::{SimulatedConnector, SimulatedDevice};

// src/hardware/mod.rs - Transport seam between the board core and the coprocessor
pub mod bridge;
pub mod protocol;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot};

use crate::address::PortName;
use crate::error::TransportError;

/// One physical line: a port and its local index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Line {
    pub port: PortName,
    pub index: u8,
}

impl Line {
    pub const fn new(port: PortName, index: u8) -> Self {
        Self { port, index }
    }
}

impl std::fmt::Display for Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.port, self.index)
    }
}

/// Internal pull resistor selection. A digital write of 0 on an INPUT pin
/// selects pull-down, 1 selects pull-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Down,
    Up,
    None,
}

impl Pull {
    pub fn from_level(level: bool) -> Self {
        if level { Pull::Up } else { Pull::Down }
    }
}

/// Synchronous reply to an exchanged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Single sentinel byte (ACK / HIGH / LOW)
    Status(u8),
    /// Payload following a DATA sentinel
    Data(Vec<u8>),
}

/// Receiver side of an exchanged request.
pub type PendingReply = oneshot::Receiver<Result<Reply, TransportError>>;

/// Unsolicited messages from the coprocessor. These never answer an
/// exchanged request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    PinChange { line: Line, level: bool },
    UartRx { port: PortName, data: Vec<u8> },
}

/// Edge selection for change interrupts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Rise,
    Fall,
    Change,
}

/// UART framing parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UartConfig {
    pub baud: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
}

impl Default for UartConfig {
    fn default() -> Self {
        Self {
            baud: 57600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Parity {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "none" => Some(Parity::None),
            "odd" => Some(Parity::Odd),
            "even" => Some(Parity::Even),
            _ => None,
        }
    }
}

/// The board driver that moves bytes to the coprocessor.
///
/// Raw primitives (`cork`, `write`, `exchange`, `uncork`) address a GPIO
/// port's socket. Line-level helpers cover the side effects a pin needs.
/// Every method is non-blocking; replies arrive through [`PendingReply`].
pub trait Transport: Send + Sync + 'static {
    /// Starts batching writes on a port so they leave as one chunk.
    fn cork(&self, port: PortName);
    fn uncork(&self, port: PortName);
    fn write(&self, port: PortName, frame: &[u8]) -> Result<(), TransportError>;
    /// Sends `frame` and registers interest in the reply it provokes as one
    /// step, so replies stay in wire order when several tasks share a port.
    /// `size` is the payload length expected after a DATA sentinel, or 0 for
    /// a status byte. Failures are delivered through the returned receiver.
    fn exchange(&self, port: PortName, frame: &[u8], size: usize) -> PendingReply;

    fn configure_input(&self, line: Line) -> Result<(), TransportError>;
    fn configure_output(&self, line: Line) -> Result<(), TransportError>;
    fn set_pull(&self, line: Line, pull: Pull) -> Result<(), TransportError>;
    fn write_level(&self, line: Line, high: bool) -> Result<(), TransportError>;
    /// Duty cycle as a fraction in [0, 1].
    fn pwm_duty_cycle(&self, line: Line, duty: f64) -> Result<(), TransportError>;
    /// Carrier frequency shared by every PWM output.
    fn pwm_frequency(&self, hz: u32) -> Result<(), TransportError>;
    fn set_interrupt(&self, line: Line, trigger: Option<Trigger>) -> Result<(), TransportError>;

    fn open_i2c(&self, port: PortName, address: u8) -> Result<Arc<dyn I2cDevice>, TransportError>;
    fn open_uart(&self, port: PortName, config: &UartConfig) -> Result<Arc<dyn UartChannel>, TransportError>;

    fn notifications(&self) -> broadcast::Receiver<Notification>;
}

/// Handle to one I2C peripheral.
#[async_trait]
pub trait I2cDevice: Send + Sync {
    fn address(&self) -> u8;
    /// Fire-and-forget write.
    fn send(&self, data: &[u8]) -> Result<(), TransportError>;
    /// Writes `tx` (possibly empty) then reads `rx_len` bytes.
    async fn transfer(&self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, TransportError>;
}

/// Handle to one UART channel.
#[async_trait]
pub trait UartChannel: Send + Sync {
    fn write(&self, data: &[u8]) -> Result<(), TransportError>;
    /// Waits for the next received chunk.
    async fn read(&self) -> Result<Vec<u8>, TransportError>;
    fn disable(&self) -> Result<(), TransportError>;
}

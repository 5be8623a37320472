// src/board/serial.rs - UART registry and receive pumps
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::Board;
use crate::address::PortName;
use crate::error::IoError;
use crate::events::{Channel, Payload};
use crate::hardware::{Parity, UartChannel, UartConfig};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SerialOptions {
    /// "A" or "B"
    pub port_id: Option<String>,
    pub baud: Option<u32>,
    pub data_bits: Option<u8>,
    /// "none", "odd" or "even"
    pub parity: Option<String>,
    pub stop_bits: Option<u8>,
}

impl SerialOptions {
    pub fn port(port_id: impl Into<String>) -> Self {
        Self {
            port_id: Some(port_id.into()),
            ..Self::default()
        }
    }

    pub fn baud(mut self, baud: u32) -> Self {
        self.baud = Some(baud);
        self
    }

    fn uart_config(&self) -> Result<UartConfig, IoError> {
        let defaults = UartConfig::default();
        let parity = match self.parity.as_deref() {
            None => defaults.parity,
            Some(value) => Parity::parse(value)
                .ok_or_else(|| IoError::UnsupportedOperation(format!("parity {}", value)))?,
        };
        Ok(UartConfig {
            baud: self.baud.filter(|&baud| baud > 0).unwrap_or(defaults.baud),
            data_bits: self.data_bits.filter(|&bits| bits > 0).unwrap_or(defaults.data_bits),
            parity,
            stop_bits: self.stop_bits.filter(|&bits| bits > 0).unwrap_or(defaults.stop_bits),
        })
    }
}

pub(crate) struct UartEntry {
    channel: Arc<dyn UartChannel>,
    pump: Option<JoinHandle<()>>,
}

impl UartEntry {
    pub(crate) fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Serial ports exist only on the two GPIO ports.
/// UART ports are named exactly "A" or "B".
fn uart_port(port_id: &str) -> Option<PortName> {
    match port_id {
        "A" => Some(PortName::A),
        "B" => Some(PortName::B),
        _ => None,
    }
}

impl Board {
    /// Opens the UART on `options.port_id`, replacing any channel already
    /// open there. Defaults: 57600 baud, 8 data bits, no parity, 1 stop bit.
    pub fn serial_config(&self, options: impl Into<Option<SerialOptions>>) -> Result<&Self, IoError> {
        let options = options.into().ok_or(IoError::MissingArgument("options"))?;
        let port_id = options.port_id.as_deref().ok_or(IoError::MissingArgument("portId"))?;
        let port = uart_port(port_id)
            .ok_or_else(|| IoError::InvalidPort(format!("{} (expected A or B)", port_id)))?;
        let config = options.uart_config()?;

        let mut state = self.state();
        if let Some(mut previous) = state.uart.remove(&port) {
            previous.stop_pump();
            if let Err(e) = previous.channel.disable() {
                tracing::warn!("Failed to disable UART on port {}: {}", port, e);
            }
        }
        let channel = self.shared.transport.open_uart(port, &config)?;
        state.uart.insert(port, UartEntry { channel, pump: None });
        tracing::debug!("UART on port {} configured: {:?}", port, config);
        Ok(self)
    }

    /// Writes bytes to an open UART. Ports without one are ignored.
    pub fn serial_write(&self, port_id: &str, data: &[u8]) -> Result<&Self, IoError> {
        if let Some(channel) = self.uart_channel(port_id) {
            channel.write(data)?;
        } else {
            tracing::trace!("serial_write to unconfigured port {}", port_id);
        }
        Ok(self)
    }

    /// Delivers every received chunk to `callback` until `serial_stop` or
    /// `serial_close`.
    pub fn serial_read(
        &self,
        port_id: &str,
        mut callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let Some(port) = uart_port(port_id) else {
            return Ok(self);
        };
        let mut state = self.state();
        let Some(entry) = state.uart.get_mut(&port) else {
            return Ok(self);
        };
        self.shared.events.on(Channel::SerialData(port), move |payload| {
            if let Some(bytes) = payload.bytes() {
                callback(bytes);
            }
        });
        if entry.pump.is_none() {
            let channel = entry.channel.clone();
            let weak = Arc::downgrade(&self.shared);
            entry.pump = Some(tokio::spawn(async move {
                loop {
                    let result = channel.read().await;
                    let Some(shared) = weak.upgrade() else {
                        break;
                    };
                    match result {
                        Ok(data) => {
                            shared.events.emit(Channel::SerialData(port), Payload::Bytes(data));
                        }
                        Err(e) => {
                            shared.report(e);
                            break;
                        }
                    }
                }
            }));
        }
        Ok(self)
    }

    /// Removes the data listeners of a port and stops its receive pump.
    pub fn serial_stop(&self, port_id: &str) -> Result<&Self, IoError> {
        if let Some(port) = uart_port(port_id) {
            self.shared.events.remove_all(Channel::SerialData(port));
            if let Some(entry) = self.state().uart.get_mut(&port) {
                entry.stop_pump();
            }
        }
        Ok(self)
    }

    /// Disables a port's UART and drops it from the registry.
    pub fn serial_close(&self, port_id: &str) -> Result<&Self, IoError> {
        let Some(port) = uart_port(port_id) else {
            return Ok(self);
        };
        self.shared.events.remove_all(Channel::SerialData(port));
        let entry = self.state().uart.remove(&port);
        if let Some(mut entry) = entry {
            entry.stop_pump();
            entry.channel.disable()?;
            tracing::debug!("UART on port {} closed", port);
        }
        Ok(self)
    }

    fn uart_channel(&self, port_id: &str) -> Option<Arc<dyn UartChannel>> {
        let port = uart_port(port_id)?;
        self.state().uart.get(&port).map(|entry| entry.channel.clone())
    }
}

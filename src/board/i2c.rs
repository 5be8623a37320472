// src/board/i2c.rs - I2C device registry and transfers
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::Arc;

use super::{Board, Shared};
use crate::address::{BusRef, to_i2c_port};
use crate::error::IoError;
use crate::events::{Channel, Payload};
use crate::hardware::I2cDevice;

/// Addresses given to `i2c_config`: one address, or named addresses that are
/// all registered.
#[derive(Debug, Clone, PartialEq)]
pub enum AddressSpec {
    Single(u8),
    Map(BTreeMap<String, u8>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct I2cOptions {
    /// Port letter or bus number; defaults to the board's primary bus
    pub bus: Option<BusRef>,
    /// Alias of `bus`
    pub port: Option<BusRef>,
    pub address: Option<AddressSpec>,
    pub addresses: Vec<u8>,
    pub delay: Option<u32>,
}

impl I2cOptions {
    pub fn address(address: u8) -> Self {
        Self {
            address: Some(AddressSpec::Single(address)),
            ..Self::default()
        }
    }

    pub fn on_bus(mut self, bus: impl Into<BusRef>) -> Self {
        self.bus = Some(bus.into());
        self
    }
}

/// Legacy shorthand: a bare number is the read delay.
impl From<u32> for I2cOptions {
    fn from(delay: u32) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }
}

pub(crate) struct I2cEntry {
    pub(crate) device: Arc<dyn I2cDevice>,
}

/// Collapses the command-plus-data and plain-data calling shapes into the
/// bytes that go on the wire.
fn write_buffer(command: Option<u8>, data: &[u8]) -> Vec<u8> {
    command.into_iter().chain(data.iter().copied()).collect()
}

impl Board {
    /// Registers one device handle per new address on the selected bus.
    /// Addresses already registered are left untouched.
    pub fn i2c_config(&self, options: impl Into<Option<I2cOptions>>) -> Result<&Self, IoError> {
        let options = options.into().ok_or(IoError::MissingArgument("options"))?;
        let port = match options.bus.or(options.port) {
            None => self.shared.primary_bus,
            Some(bus) => to_i2c_port(bus.clone())
                .ok_or_else(|| IoError::InvalidPort(format!("no I2C bus {}", bus)))?,
        };

        let mut addresses = match options.address {
            Some(AddressSpec::Single(address)) => vec![address],
            Some(AddressSpec::Map(named)) => named.into_values().collect(),
            None => Vec::new(),
        };
        addresses.extend(options.addresses);

        let mut state = self.state();
        for address in addresses {
            if address == 0 || state.i2c.contains_key(&address) {
                continue;
            }
            let device = self.shared.transport.open_i2c(port, address)?;
            state.i2c.insert(address, I2cEntry { device });
            tracing::debug!("Registered I2C device {:#04x} on port {}", address, port);
        }
        Ok(self)
    }

    /// Writes raw bytes. An empty buffer sends nothing.
    pub fn i2c_write(&self, address: u8, data: &[u8]) -> Result<&Self, IoError> {
        self.send_i2c(address, write_buffer(None, data))
    }

    /// Writes a command byte followed by `data`.
    pub fn i2c_write_command(&self, address: u8, command: u8, data: &[u8]) -> Result<&Self, IoError> {
        self.send_i2c(address, write_buffer(Some(command), data))
    }

    pub fn i2c_write_reg(&self, address: u8, register: u8, value: u8) -> Result<&Self, IoError> {
        self.i2c_write(address, &[register, value])
    }

    fn send_i2c(&self, address: u8, buffer: Vec<u8>) -> Result<&Self, IoError> {
        let device = self.i2c_device(address)?;
        if !buffer.is_empty() {
            device.send(&buffer)?;
        }
        Ok(self)
    }

    /// Reads `len` bytes once, after writing `register` if given. The reply
    /// goes to `callback`; a failed transfer is published on the error
    /// channel.
    pub fn i2c_read_once(
        &self,
        address: u8,
        register: Option<u8>,
        len: usize,
        mut callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let device = self.i2c_device(address)?;
        let channel = Channel::I2cReply { address, register };
        self.shared.events.once(channel, move |payload| {
            if let Some(bytes) = payload.bytes() {
                callback(bytes);
            }
        });

        let weak = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            let tx: Vec<u8> = register.into_iter().collect();
            let result = device.transfer(&tx, len).await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(bytes) => {
                    shared.events.emit(channel, Payload::Bytes(bytes));
                }
                Err(e) => shared.report(e),
            }
        });
        Ok(self)
    }

    /// Continuous `i2c_read_once` at the sampling cadence. Stops after the
    /// first failed transfer.
    pub fn i2c_read(
        &self,
        address: u8,
        register: Option<u8>,
        len: usize,
        mut callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let device = self.i2c_device(address)?;
        let channel = Channel::I2cReply { address, register };
        self.shared.events.on(channel, move |payload| {
            if let Some(bytes) = payload.bytes() {
                callback(bytes);
            }
        });

        let tx: Vec<u8> = register.into_iter().collect();
        let _ = self
            .shared
            .scheduler
            .spawn_poller(Arc::downgrade(&self.shared), move |shared: Arc<Shared>| {
                let device = device.clone();
                let tx = tx.clone();
                async move {
                    match device.transfer(&tx, len).await {
                        Ok(bytes) => {
                            shared.events.emit(channel, Payload::Bytes(bytes));
                            ControlFlow::Continue(())
                        }
                        Err(e) => {
                            shared.report(e);
                            ControlFlow::Break(())
                        }
                    }
                }
            });
        Ok(self)
    }

    pub fn send_i2c_config(&self, options: impl Into<Option<I2cOptions>>) -> Result<&Self, IoError> {
        self.i2c_config(options)
    }

    pub fn send_i2c_write_request(&self, address: u8, data: &[u8]) -> Result<&Self, IoError> {
        self.i2c_write(address, data)
    }

    pub fn send_i2c_read_request(
        &self,
        address: u8,
        len: usize,
        callback: impl FnMut(&[u8]) + Send + 'static,
    ) -> Result<&Self, IoError> {
        self.i2c_read_once(address, None, len, callback)
    }

    fn i2c_device(&self, address: u8) -> Result<Arc<dyn I2cDevice>, IoError> {
        self.state()
            .i2c
            .get(&address)
            .map(|entry| entry.device.clone())
            .ok_or(IoError::UnknownDevice(address))
    }
}

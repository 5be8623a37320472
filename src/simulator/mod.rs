//! In-memory transport for tests, benches and the simulation harness.
//!
//! [`SimTransport`] answers the same read frames the coprocessor does, from
//! scripted input levels and ADC values, and records every side effect as a
//! [`SimOp`] so callers can assert on exactly what a board sent.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};

use crate::address::{PortName, to_port_identity};
use crate::error::TransportError;
use crate::hardware::protocol::{cmd, reply};
use crate::hardware::{
    I2cDevice, Line, Notification, PendingReply, Pull, Reply, Transport, Trigger, UartChannel, UartConfig,
};
use crate::lock;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum SimOp {
    Cork(PortName),
    Uncork(PortName),
    Write(PortName, Vec<u8>),
    Exchange(PortName, Vec<u8>, usize),
    ConfigureInput(Line),
    ConfigureOutput(Line),
    Pull(Line, Pull),
    Level(Line, bool),
    DutyCycle(Line, f64),
    Frequency(u32),
    Interrupt(Line, Option<Trigger>),
    OpenI2c(PortName, u8),
    I2cSend(u8, Vec<u8>),
    I2cTransfer(u8, Vec<u8>, usize),
    OpenUart(PortName, UartConfig),
    UartWrite(PortName, Vec<u8>),
    UartDisable(PortName),
}

#[derive(Default)]
struct SimState {
    ops: Vec<SimOp>,
    levels: HashMap<Line, bool>,
    analog: HashMap<Line, u16>,
    read_error: Option<TransportError>,
    latency: Duration,
    frequency: Option<u32>,
    i2c_replies: HashMap<u8, VecDeque<Result<Vec<u8>, TransportError>>>,
    uart: HashMap<PortName, broadcast::Sender<Vec<u8>>>,
}

fn line_of(index: usize) -> Option<Line> {
    let identity = to_port_identity(index as i64);
    identity.port.map(|port| Line::new(port, identity.index as u8))
}

/// Scriptable transport. Replies are produced as soon as a frame is exchanged,
/// after an optional simulated latency.
pub struct SimTransport {
    state: Arc<Mutex<SimState>>,
    notify: broadcast::Sender<Notification>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(SimState::default())),
            notify,
        }
    }

    /// Level returned to digital reads of a canonical pin.
    pub fn set_level(&self, index: usize, high: bool) {
        if let Some(line) = line_of(index) {
            lock(&self.state).levels.insert(line, high);
        }
    }

    /// 10-bit reading returned to analog reads of a canonical pin.
    pub fn set_analog(&self, index: usize, value: u16) {
        if let Some(line) = line_of(index) {
            // The ADC reports 12 bits; boards shift the low two away
            lock(&self.state).analog.insert(line, (value.min(1023) << 2) | 0b11);
        }
    }

    /// Makes every following read exchange fail, or succeed again with `None`.
    pub fn set_read_error(&self, error: Option<TransportError>) {
        lock(&self.state).read_error = error;
    }

    pub fn set_latency(&self, latency: Duration) {
        lock(&self.state).latency = latency;
    }

    /// Queues an I2C read result for `address`. The last queued result is
    /// repeated once the queue drains to it.
    pub fn push_i2c_reply(&self, address: u8, reply: Result<Vec<u8>, TransportError>) {
        lock(&self.state)
            .i2c_replies
            .entry(address)
            .or_default()
            .push_back(reply);
    }

    /// Raises an asynchronous pin-change notification.
    pub fn pin_change(&self, index: usize, level: bool) {
        if let Some(line) = line_of(index) {
            lock(&self.state).levels.insert(line, level);
            let _ = self.notify.send(Notification::PinChange { line, level });
        }
    }

    /// Delivers bytes to an open UART on `port`.
    pub fn uart_receive(&self, port: PortName, data: &[u8]) {
        if let Some(tx) = lock(&self.state).uart.get(&port) {
            let _ = tx.send(data.to_vec());
        }
        let _ = self.notify.send(Notification::UartRx {
            port,
            data: data.to_vec(),
        });
    }

    pub fn ops(&self) -> Vec<SimOp> {
        lock(&self.state).ops.clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.state).ops.clear();
    }

    pub fn count(&self, predicate: impl Fn(&SimOp) -> bool) -> usize {
        lock(&self.state).ops.iter().filter(|op| predicate(op)).count()
    }

    pub fn frequency(&self) -> Option<u32> {
        lock(&self.state).frequency
    }

    fn record(&self, op: SimOp) {
        tracing::trace!("Sim {:?}", op);
        lock(&self.state).ops.push(op);
    }

    fn answer(state: &SimState, port: PortName, frame: &[u8], size: usize) -> Result<Reply, TransportError> {
        let is_read = matches!(frame, [cmd::GPIO_IN, _] | [cmd::ANALOG_READ, _]);
        if let (true, Some(error)) = (is_read, &state.read_error) {
            return Err(error.clone());
        }
        match frame {
            [cmd::GPIO_IN, line] => {
                let high = state.levels.get(&Line::new(port, *line)).copied().unwrap_or(false);
                Ok(Reply::Status(if high { reply::HIGH } else { reply::LOW }))
            }
            [cmd::ANALOG_READ, line] => {
                let raw = state.analog.get(&Line::new(port, *line)).copied().unwrap_or(0);
                Ok(Reply::Data(raw.to_le_bytes().to_vec()))
            }
            _ if size > 0 => Ok(Reply::Data(vec![0; size])),
            _ => Ok(Reply::Status(reply::ACK)),
        }
    }
}

impl Transport for SimTransport {
    fn cork(&self, port: PortName) {
        self.record(SimOp::Cork(port));
    }

    fn uncork(&self, port: PortName) {
        self.record(SimOp::Uncork(port));
    }

    fn write(&self, port: PortName, frame: &[u8]) -> Result<(), TransportError> {
        if !port.is_gpio() {
            return Err(TransportError::NoSocket(port));
        }
        self.record(SimOp::Write(port, frame.to_vec()));
        Ok(())
    }

    fn exchange(&self, port: PortName, frame: &[u8], size: usize) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if !port.is_gpio() {
            let _ = tx.send(Err(TransportError::NoSocket(port)));
            return rx;
        }
        let (result, latency) = {
            let mut state = lock(&self.state);
            state.ops.push(SimOp::Exchange(port, frame.to_vec(), size));
            (Self::answer(&state, port, frame, size), state.latency)
        };
        if latency.is_zero() {
            let _ = tx.send(result);
        } else {
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                let _ = tx.send(result);
            });
        }
        rx
    }

    fn configure_input(&self, line: Line) -> Result<(), TransportError> {
        self.record(SimOp::ConfigureInput(line));
        Ok(())
    }

    fn configure_output(&self, line: Line) -> Result<(), TransportError> {
        self.record(SimOp::ConfigureOutput(line));
        Ok(())
    }

    fn set_pull(&self, line: Line, pull: Pull) -> Result<(), TransportError> {
        self.record(SimOp::Pull(line, pull));
        Ok(())
    }

    fn write_level(&self, line: Line, high: bool) -> Result<(), TransportError> {
        self.record(SimOp::Level(line, high));
        Ok(())
    }

    fn pwm_duty_cycle(&self, line: Line, duty: f64) -> Result<(), TransportError> {
        if self.frequency().is_none() {
            return Err(TransportError::Unsupported("PWM frequency has not been set".to_string()));
        }
        self.record(SimOp::DutyCycle(line, duty));
        Ok(())
    }

    fn pwm_frequency(&self, hz: u32) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        state.ops.push(SimOp::Frequency(hz));
        state.frequency = Some(hz);
        Ok(())
    }

    fn set_interrupt(&self, line: Line, trigger: Option<Trigger>) -> Result<(), TransportError> {
        self.record(SimOp::Interrupt(line, trigger));
        Ok(())
    }

    fn open_i2c(&self, port: PortName, address: u8) -> Result<Arc<dyn I2cDevice>, TransportError> {
        self.record(SimOp::OpenI2c(port, address));
        Ok(Arc::new(SimI2c {
            state: self.state.clone(),
            address,
        }))
    }

    fn open_uart(&self, port: PortName, config: &UartConfig) -> Result<Arc<dyn UartChannel>, TransportError> {
        let rx = {
            let mut state = lock(&self.state);
            state.ops.push(SimOp::OpenUart(port, config.clone()));
            state
                .uart
                .entry(port)
                .or_insert_with(|| broadcast::channel(64).0)
                .subscribe()
        };
        Ok(Arc::new(SimUart {
            port,
            state: self.state.clone(),
            rx: tokio::sync::Mutex::new(rx),
        }))
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }
}

struct SimI2c {
    state: Arc<Mutex<SimState>>,
    address: u8,
}

#[async_trait]
impl I2cDevice for SimI2c {
    fn address(&self) -> u8 {
        self.address
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        lock(&self.state).ops.push(SimOp::I2cSend(self.address, data.to_vec()));
        Ok(())
    }

    async fn transfer(&self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, TransportError> {
        let (result, latency) = {
            let mut state = lock(&self.state);
            state.ops.push(SimOp::I2cTransfer(self.address, tx.to_vec(), rx_len));
            let queue = state.i2c_replies.entry(self.address).or_default();
            let result = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            (result.unwrap_or_else(|| Ok(Vec::new())), state.latency)
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        result.map(|mut data| {
            data.resize(rx_len, 0);
            data
        })
    }
}

struct SimUart {
    port: PortName,
    state: Arc<Mutex<SimState>>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
}

#[async_trait]
impl UartChannel for SimUart {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        lock(&self.state).ops.push(SimOp::UartWrite(self.port, data.to_vec()));
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(data) => return Ok(data),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    fn disable(&self) -> Result<(), TransportError> {
        lock(&self.state).ops.push(SimOp::UartDisable(self.port));
        Ok(())
    }
}

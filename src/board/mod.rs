//! # Board
//!
//! The board owns the pin table, the I2C device and UART registries, the
//! shared PWM carrier frequency and the interrupt bookkeeping, and exposes the
//! operation surface used by host automation frameworks.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tessel_io::{Board, BoardOptions, capabilities::Mode, simulator::SimTransport};
//!
//! # async fn demo() -> Result<(), tessel_io::IoError> {
//! let board = Board::new(Arc::new(SimTransport::new()), BoardOptions::default());
//! board.ready().await;
//! board.pin_mode("a2", Mode::Input)?.digital_read("a2", |value| println!("a2 = {value}"))?;
//! board.pin_mode("b7", Mode::Pwm)?.pwm_write("b7", 128)?;
//! # Ok(())
//! # }
//! ```
//!
//! Every operation that takes a pin accepts a canonical index, a numeric
//! string or a symbolic name. `pin_mode` ignores pins it cannot resolve;
//! every other operation reports them as [`IoError::UnsupportedPin`].

mod i2c;
mod serial;

pub use i2c::{AddressSpec, I2cOptions};
pub use serial::SerialOptions;

use futures_core::Stream;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::address::{BusRef, PIN_COUNT, PinRef, PortName, to_i2c_port, to_pin_index};
use crate::capabilities::{ANALOG_PINS, DAC_PIN, Mode, PWM_PINS, SERVO_PINS, capabilities};
use crate::error::{IoError, TransportError};
use crate::events::{Channel, Emitter, Payload};
use crate::hardware::{Notification, Transport, Trigger};
use crate::lock;
use crate::pin::{Pin, PinSnapshot, ServoRange};
use crate::scheduler::{DEFAULT_SAMPLING_INTERVAL, SamplingScheduler};

/// Carrier frequency for PWM outputs.
pub const PWM_FREQUENCY: u32 = 490;
/// Carrier frequency for servo outputs.
pub const SERVO_FREQUENCY: u32 = 50;
/// Servo frame length in microseconds at [`SERVO_FREQUENCY`].
const SERVO_PERIOD_US: f64 = 20_000.0;
/// `servo_write` values at or above this are pulse widths in microseconds.
const SERVO_MICROSECONDS_MIN: f64 = 544.0;
/// Analog reference voltage.
pub const AREF: f64 = 3.3;

static BOARDS: Mutex<Vec<Board>> = Mutex::new(Vec::new());

#[derive(Debug, Clone)]
pub struct BoardOptions {
    pub name: Option<String>,
    /// Milliseconds; clamped to [5, 65535]
    pub sampling_interval: u32,
    /// Primary I2C bus, used when `i2c_config` names none
    pub i2c_bus: Option<BusRef>,
}

impl Default for BoardOptions {
    fn default() -> Self {
        Self {
            name: None,
            sampling_interval: DEFAULT_SAMPLING_INTERVAL,
            i2c_bus: None,
        }
    }
}

/// Servo range registration, positional `(pin, min, max)` or by field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServoOptions {
    pub pin: Option<PinRef>,
    pub min: Option<u32>,
    pub max: Option<u32>,
}

impl<P: Into<PinRef>> From<(P, u32, u32)> for ServoOptions {
    fn from((pin, min, max): (P, u32, u32)) -> Self {
        Self {
            pin: Some(pin.into()),
            min: Some(min),
            max: Some(max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadOp {
    Digital,
    Analog,
}

pub(crate) struct BoardState {
    pins: Vec<Pin>,
    pwm_frequency: Option<u32>,
    i2c: BTreeMap<u8, i2c::I2cEntry>,
    uart: HashMap<PortName, serial::UartEntry>,
    interrupts: HashMap<PortName, BTreeSet<u8>>,
}

pub(crate) struct Shared {
    name: String,
    transport: Arc<dyn Transport>,
    state: Mutex<BoardState>,
    events: Emitter,
    scheduler: SamplingScheduler,
    ready: watch::Sender<bool>,
    primary_bus: PortName,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BoardState> {
        lock(&self.state)
    }

    /// Publishes a failure of an asynchronous exchange.
    fn report(&self, error: TransportError) {
        tracing::warn!("{}: {}", self.name, error);
        self.events.emit(Channel::Error, Payload::Error(error));
    }

    fn publish_sample(&self, index: usize, op: ReadOp, value: u16) {
        let channel = {
            let mut state = self.state();
            let pin = &mut state.pins[index];
            // digital_read only republishes changes
            if op == ReadOp::Digital && pin.value() == value as f64 {
                return;
            }
            pin.set_value(value as f64);
            match op {
                ReadOp::Digital => Channel::DigitalRead(index),
                ReadOp::Analog => Channel::AnalogRead(index),
            }
        };
        self.events.emit(channel, Payload::Value(value));
    }

    fn handle_notification(&self, notification: Notification) {
        let Notification::PinChange { line, level } = notification else {
            return;
        };
        let index = line.port.offset() + line.index as usize;
        {
            let mut state = self.state();
            let armed = state
                .interrupts
                .get(&line.port)
                .is_some_and(|lines| lines.contains(&line.index));
            if !armed || index >= state.pins.len() {
                return;
            }
            state.pins[index].set_value(level as u8 as f64);
        }
        self.events.emit(Channel::PinChange(index), Payload::Value(level as u16));
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.uart.values_mut() {
            entry.stop_pump();
        }
    }
}

/// Handle to one board. Clones share the same state.
#[derive(Clone)]
pub struct Board {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("name", &self.shared.name)
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Board {
    pub const HIGH: u8 = 1;
    pub const LOW: u8 = 0;
    pub const MODES: [Mode; 7] = Mode::ALL;

    /// Creates a board over `transport` and adds it to the process-wide list.
    /// `connect` and `ready` are emitted from a spawned task, so on a
    /// multi-threaded runtime they may fire before this returns. Both are
    /// latched: a listener registered after either fired is invoked at once.
    /// Must be called inside a tokio runtime.
    pub fn new(transport: Arc<dyn Transport>, options: BoardOptions) -> Board {
        let primary_bus = match options.i2c_bus.clone() {
            None => PortName::A,
            Some(bus) => to_i2c_port(bus.clone()).unwrap_or_else(|| {
                tracing::warn!("Unknown I2C bus {}, using port A", bus);
                PortName::A
            }),
        };
        let pins = (0..PIN_COUNT).filter_map(Pin::new).collect();
        let notifications = transport.notifications();
        let shared = Arc::new(Shared {
            name: options.name.unwrap_or_else(default_name),
            transport,
            state: Mutex::new(BoardState {
                pins,
                pwm_frequency: None,
                i2c: BTreeMap::new(),
                uart: HashMap::new(),
                interrupts: HashMap::new(),
            }),
            events: Emitter::new(),
            scheduler: SamplingScheduler::new(options.sampling_interval as i64),
            ready: watch::channel(false).0,
            primary_bus,
            tasks: Mutex::new(Vec::new()),
        });

        let ready = tokio::spawn({
            let weak = Arc::downgrade(&shared);
            async move {
                tokio::task::yield_now().await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                shared.events.emit_latched(Channel::Connect, Payload::Unit);
                shared.ready.send_replace(true);
                tracing::info!("{} ready", shared.name);
                shared.events.emit_latched(Channel::Ready, Payload::Unit);
            }
        });
        let pump = tokio::spawn(notification_pump(Arc::downgrade(&shared), notifications));
        lock(&shared.tasks).extend([ready, pump]);

        tracing::info!("Created board {}", shared.name);
        let board = Board { shared };
        lock(&BOARDS).push(board.clone());
        board
    }

    /// Number of boards created since the last [`Board::purge`].
    pub fn registered() -> usize {
        lock(&BOARDS).len()
    }

    /// Clears the process-wide board list.
    pub fn purge() {
        let purged = std::mem::take(&mut *lock(&BOARDS));
        tracing::info!("Purged {} boards", purged.len());
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn aref(&self) -> f64 {
        AREF
    }

    pub fn analog_pins(&self) -> &'static [usize] {
        &ANALOG_PINS
    }

    pub fn is_ready(&self) -> bool {
        *self.shared.ready.borrow()
    }

    /// Resolves once the board has emitted `ready`.
    pub async fn ready(&self) {
        let mut rx = self.shared.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn pins(&self) -> Vec<PinSnapshot> {
        self.state().pins.iter().map(Pin::snapshot).collect()
    }

    pub fn pin(&self, pin: impl Into<PinRef>) -> Option<PinSnapshot> {
        let index = to_pin_index(pin)?;
        Some(self.state().pins[index].snapshot())
    }

    /// Canonical index for any accepted pin spelling.
    pub fn normalize(&self, pin: impl Into<PinRef>) -> Option<usize> {
        to_pin_index(pin)
    }

    pub fn sampling_interval(&self) -> u32 {
        self.shared.scheduler.millis()
    }

    pub fn set_sampling_interval(&self, ms: i64) -> &Self {
        let applied = self.shared.scheduler.set(ms);
        tracing::debug!("Sampling interval set to {} ms", applied);
        self
    }

    pub fn on(&self, channel: Channel, callback: impl FnMut(&Payload) + Send + 'static) -> &Self {
        self.shared.events.on(channel, callback);
        self
    }

    pub fn once(&self, channel: Channel, callback: impl FnMut(&Payload) + Send + 'static) -> &Self {
        self.shared.events.once(channel, callback);
        self
    }

    pub fn remove_all_listeners(&self, channel: Channel) -> &Self {
        self.shared.events.remove_all(channel);
        self
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        self.shared.events.listener_count(channel)
    }

    pub fn subscribe(&self, channel: Channel) -> impl Stream<Item = Payload> + Send + 'static {
        self.shared.events.subscribe(channel)
    }

    pub fn pin_mode(&self, pin: impl Into<PinRef>, mode: Mode) -> Result<&Self, IoError> {
        let Some(index) = to_pin_index(pin) else {
            return Ok(self);
        };
        self.state().pins[index].set_mode(mode, &*self.shared.transport)?;
        Ok(self)
    }

    /// `pin_mode` with a Firmata mode code; unrecognized codes are ignored.
    pub fn pin_mode_code(&self, pin: impl Into<PinRef>, code: u8) -> Result<&Self, IoError> {
        match Mode::from_code(code) {
            Some(mode) => self.pin_mode(pin, mode),
            None => Ok(self),
        }
    }

    /// Polls the pin every sampling interval and calls `callback` when the
    /// sampled level differs from the last known one.
    pub fn digital_read(
        &self,
        pin: impl Into<PinRef>,
        mut callback: impl FnMut(u16) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let index = resolve(pin)?;
        if capabilities(index).is_some_and(|caps| caps.is_indicator()) {
            return Err(IoError::UnsupportedPin(format!("{} cannot be read", pin_name(index))));
        }
        self.shared.events.on(Channel::DigitalRead(index), move |payload| {
            if let Some(value) = payload.value() {
                callback(value);
            }
        });
        self.start_read(index, ReadOp::Digital);
        Ok(self)
    }

    /// Polls an analog-capable pin and calls `callback` with every 10-bit
    /// sample.
    pub fn analog_read(
        &self,
        pin: impl Into<PinRef>,
        mut callback: impl FnMut(u16) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let pin = pin.into();
        let index = to_pin_index(pin.clone())
            .filter(|index| ANALOG_PINS.contains(index))
            .ok_or_else(|| {
                IoError::UnsupportedPin(format!(
                    "analog_read called with {}; use A4, A7 or B0-B7",
                    pin
                ))
            })?;
        self.shared.events.on(Channel::AnalogRead(index), move |payload| {
            if let Some(value) = payload.value() {
                callback(value);
            }
        });
        self.start_read(index, ReadOp::Analog);
        Ok(self)
    }

    fn start_read(&self, index: usize, op: ReadOp) {
        let _ = self
            .shared
            .scheduler
            .spawn_poller(Arc::downgrade(&self.shared), move |shared: Arc<Shared>| async move {
                let request = shared.state().pins[index].read_request();
                match request.exchange(&*shared.transport).await {
                    Ok(value) => {
                        tracing::trace!("{} sampled {}", pin_name(index), value);
                        shared.publish_sample(index, op, value);
                        ControlFlow::Continue(())
                    }
                    Err(TransportError::Closed) => {
                        shared.report(TransportError::Closed);
                        ControlFlow::Break(())
                    }
                    Err(e) => {
                        shared.report(e);
                        ControlFlow::Continue(())
                    }
                }
            });
    }

    /// Writes a level, clamped to 0 or 1. On an INPUT pin this selects the
    /// pull resistor instead.
    pub fn digital_write(&self, pin: impl Into<PinRef>, value: i64) -> Result<&Self, IoError> {
        let index = resolve(pin)?;
        let value = value.clamp(0, 1) as f64;
        self.state().pins[index].write(value, &*self.shared.transport)?;
        Ok(self)
    }

    /// Writes a PWM value in [0, 255]. B7 drives the DAC instead of a PWM
    /// channel.
    pub fn pwm_write(&self, pin: impl Into<PinRef>, value: impl Into<f64>) -> Result<&Self, IoError> {
        let index = resolve(pin)?;
        let value = constrain(value.into(), 0.0, 255.0);
        if !PWM_PINS.contains(&index) {
            tracing::warn!("pwm_write ignored on {}", pin_name(index));
            return Ok(self);
        }
        let mut state = self.state();
        let output = if index == DAC_PIN {
            scale(value, 0.0, 255.0, 0.0, 1023.0).trunc()
        } else {
            self.ensure_frequency(&mut state, PWM_FREQUENCY)?;
            scale(value, 0.0, 255.0, 0.0, 1.0)
        };
        state.pins[index].write(output, &*self.shared.transport)?;
        Ok(self)
    }

    pub fn analog_write(&self, pin: impl Into<PinRef>, value: impl Into<f64>) -> Result<&Self, IoError> {
        self.pwm_write(pin, value)
    }

    /// Positions a servo: degrees in [0, 180], or a pulse width in
    /// microseconds for values of 544 and above.
    pub fn servo_write(&self, pin: impl Into<PinRef>, value: impl Into<f64>) -> Result<&Self, IoError> {
        let index = resolve(pin)?;
        if !SERVO_PINS.contains(&index) {
            tracing::warn!("servo_write ignored on {}", pin_name(index));
            return Ok(self);
        }
        let mut state = self.state();
        self.ensure_frequency(&mut state, SERVO_FREQUENCY)?;
        let range = state.pins[index].servo_range();
        let duty = servo_duty(value.into(), range);
        state.pins[index].write(duty, &*self.shared.transport)?;
        Ok(self)
    }

    /// Registers a custom pulse range for one servo pin.
    pub fn servo_config(&self, options: impl Into<ServoOptions>) -> Result<&Self, IoError> {
        let options = options.into();
        let pin = options
            .pin
            .filter(|pin| *pin != PinRef::Unset)
            .ok_or(IoError::MissingArgument("pin"))?;
        let min = options.min.ok_or(IoError::MissingArgument("min"))?;
        let max = options.max.ok_or(IoError::MissingArgument("max"))?;
        let index = to_pin_index(pin.clone())
            .filter(|index| SERVO_PINS.contains(index))
            .ok_or_else(|| IoError::UnsupportedPin(format!("{} is not a servo pin", pin)))?;
        if min >= max {
            return Err(IoError::UnsupportedOperation(format!(
                "servo range {}-{} is empty",
                min, max
            )));
        }
        self.state().pins[index].set_servo_range(ServoRange { min, max });
        tracing::debug!("Servo range on {} set to {}-{} us", pin_name(index), min, max);
        Ok(self)
    }

    fn ensure_frequency(&self, state: &mut BoardState, hz: u32) -> Result<(), IoError> {
        if state.pwm_frequency != Some(hz) {
            self.shared.transport.pwm_frequency(hz)?;
            state.pwm_frequency = Some(hz);
            tracing::debug!("PWM carrier frequency set to {} Hz", hz);
        }
        Ok(())
    }

    /// Arms a change interrupt and calls `callback` with the new level on
    /// every edge.
    pub fn on_pin_change(
        &self,
        pin: impl Into<PinRef>,
        mut callback: impl FnMut(u16) + Send + 'static,
    ) -> Result<&Self, IoError> {
        let (index, line) = self.interrupt_line(pin)?;
        self.shared.events.on(Channel::PinChange(index), move |payload| {
            if let Some(value) = payload.value() {
                callback(value);
            }
        });
        let mut state = self.state();
        if state.interrupts.entry(line.port).or_default().insert(line.index) {
            self.shared.transport.set_interrupt(line, Some(Trigger::Change))?;
            tracing::debug!("Armed change interrupt on {}", line);
        }
        Ok(self)
    }

    pub fn remove_pin_change(&self, pin: impl Into<PinRef>) -> Result<&Self, IoError> {
        let (index, line) = self.interrupt_line(pin)?;
        self.shared.events.remove_all(Channel::PinChange(index));
        let mut state = self.state();
        let armed = state
            .interrupts
            .get_mut(&line.port)
            .is_some_and(|lines| lines.remove(&line.index));
        if armed {
            self.shared.transport.set_interrupt(line, None)?;
            tracing::debug!("Disarmed change interrupt on {}", line);
        }
        Ok(self)
    }

    fn interrupt_line(&self, pin: impl Into<PinRef>) -> Result<(usize, crate::hardware::Line), IoError> {
        let pin = pin.into();
        let caps = to_pin_index(pin.clone())
            .and_then(capabilities)
            .filter(|caps| caps.interrupt)
            .ok_or_else(|| IoError::UnsupportedPin(format!("{} cannot raise interrupts", pin)))?;
        Ok((caps.index, crate::hardware::Line::new(caps.port, caps.line)))
    }

    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.shared.state()
    }
}

async fn notification_pump(shared: std::sync::Weak<Shared>, mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(notification) => {
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.handle_notification(notification);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Dropped {} hardware notifications", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn resolve(pin: impl Into<PinRef>) -> Result<usize, IoError> {
    let pin = pin.into();
    to_pin_index(pin.clone()).ok_or_else(|| IoError::UnsupportedPin(pin.to_string()))
}

fn pin_name(index: usize) -> String {
    crate::address::to_symbolic_name(index).unwrap_or_else(|| index.to_string())
}

fn default_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("Tessel 2 ({})", host)
}

fn constrain(value: f64, low: f64, high: f64) -> f64 {
    if value.is_nan() { low } else { value.clamp(low, high) }
}

fn scale(value: f64, from_low: f64, from_high: f64, to_low: f64, to_high: f64) -> f64 {
    (value - from_low) * (to_high - to_low) / (from_high - from_low) + to_low
}

/// Duty fraction for a servo position within `range`.
fn servo_duty(value: f64, range: ServoRange) -> f64 {
    let (min, max) = (range.min as f64, range.max as f64);
    if value >= SERVO_MICROSECONDS_MIN {
        constrain(value, min, max) / SERVO_PERIOD_US
    } else {
        scale(
            constrain(value, 0.0, 180.0),
            0.0,
            180.0,
            min / SERVO_PERIOD_US,
            max / SERVO_PERIOD_US,
        )
    }
}

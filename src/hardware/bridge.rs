// src/hardware/bridge.rs - Bridge transport over per-port byte streams
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::protocol::{self, Parsed, ReplyParser, reply};
use super::{I2cDevice, Line, Notification, PendingReply, Pull, Reply, Transport, Trigger, UartChannel, UartConfig};
use crate::address::PortName;
use crate::error::TransportError;
use crate::lock;

const NOTIFICATION_CAPACITY: usize = 256;
const I2C_FREQUENCY_HZ: u32 = 100_000;

/// Traffic counters for one port socket.
#[derive(Debug, Clone, Default)]
pub struct BridgeStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub replies: u64,
    pub notifications: u64,
    pub errors: u64,
}

struct PendingRequest {
    size: usize,
    reply: oneshot::Sender<Result<Reply, TransportError>>,
}

#[derive(Default)]
struct LinkState {
    corked: usize,
    batch: Vec<u8>,
    pending: VecDeque<PendingRequest>,
    closed: bool,
    stats: BridgeStats,
}

/// One port's socket: a writer task fed through a channel and a reader task
/// that correlates replies with the FIFO of pending requests.
struct PortLink {
    port: PortName,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    state: Arc<Mutex<LinkState>>,
    uart_rx: broadcast::Sender<Vec<u8>>,
}

impl PortLink {
    fn spawn<S>(port: PortName, stream: S, notify: broadcast::Sender<Notification>) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let state = Arc::new(Mutex::new(LinkState::default()));
        let (uart_rx, _) = broadcast::channel(NOTIFICATION_CAPACITY);

        tokio::spawn(async move {
            while let Some(chunk) = outbound_rx.recv().await {
                tracing::trace!("Bridge TX {}: {:02x?}", port, chunk);
                if let Err(e) = writer.write_all(&chunk).await {
                    tracing::error!("Bridge write error on port {}: {}", port, e);
                    break;
                }
                let _ = writer.flush().await;
            }
            tracing::info!("Bridge writer task for port {} terminated", port);
        });

        let reader_state = state.clone();
        let reader_uart = uart_rx.clone();
        tokio::spawn(async move {
            let mut parser = ReplyParser::new();
            let mut buf = [0u8; 256];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => {
                        tracing::info!("Bridge socket for port {} closed by remote", port);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        tracing::error!("Bridge read error on port {}: {}", port, e);
                        break;
                    }
                };
                for &byte in &buf[..n] {
                    route_byte(port, byte, &mut parser, &reader_state, &notify, &reader_uart);
                }
            }
            let mut state = lock(&reader_state);
            state.closed = true;
            for request in state.pending.drain(..) {
                let _ = request.reply.send(Err(TransportError::Closed));
            }
        });

        Arc::new(Self {
            port,
            outbound,
            state,
            uart_rx,
        })
    }

    fn cork(&self) {
        lock(&self.state).corked += 1;
    }

    fn uncork(&self) {
        let mut state = lock(&self.state);
        state.corked = state.corked.saturating_sub(1);
        if state.corked > 0 || state.batch.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut state.batch);
        let len = batch.len() as u64;
        if self.outbound.send(batch).is_ok() {
            state.stats.bytes_sent += len;
        }
    }

    /// Batches or sends `frame`. Callers hold the state lock, so chunks reach
    /// the writer task in the same order requests join the pending FIFO.
    fn push(&self, state: &mut LinkState, frame: &[u8]) -> Result<(), TransportError> {
        if state.closed {
            return Err(TransportError::Closed);
        }
        if state.corked > 0 {
            state.batch.extend_from_slice(frame);
            return Ok(());
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| TransportError::Closed)?;
        state.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    fn write(&self, frame: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.state);
        self.push(&mut state, frame)
    }

    fn exchange(&self, frame: &[u8], size: usize) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        let mut state = lock(&self.state);
        match self.push(&mut state, frame) {
            Ok(()) => state.pending.push_back(PendingRequest { size, reply: tx }),
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }
        rx
    }
}

fn route_byte(
    port: PortName,
    byte: u8,
    parser: &mut ReplyParser,
    state: &Mutex<LinkState>,
    notify: &broadcast::Sender<Notification>,
    uart: &broadcast::Sender<Vec<u8>>,
) {
    let mut state = lock(state);
    state.stats.bytes_received += 1;
    let expected = state.pending.front().map(|request| request.size);
    let parsed = match parser.feed(byte, expected) {
        Ok(Some(parsed)) => parsed,
        Ok(None) => return,
        Err(e) => {
            state.stats.errors += 1;
            tracing::warn!("Bridge port {}: {}", port, e);
            parser.reset();
            return;
        }
    };
    tracing::trace!("Bridge RX {}: {:?}", port, parsed);
    match parsed {
        Parsed::Status(status) => {
            let Some(request) = state.pending.pop_front() else {
                state.stats.errors += 1;
                tracing::warn!("Bridge port {}: reply {:#04x} with no pending request", port, status);
                return;
            };
            state.stats.replies += 1;
            let result = match status {
                reply::NACK => Err(TransportError::Nack),
                _ if request.size > 0 => Err(TransportError::UnexpectedReply(status)),
                _ => Ok(Reply::Status(status)),
            };
            let _ = request.reply.send(result);
        }
        Parsed::Data(data) => {
            if let Some(request) = state.pending.pop_front() {
                state.stats.replies += 1;
                let _ = request.reply.send(Ok(Reply::Data(data)));
            }
        }
        Parsed::PinChange { line, level } => {
            state.stats.notifications += 1;
            let _ = notify.send(Notification::PinChange {
                line: Line::new(port, line),
                level,
            });
        }
        Parsed::UartRx(data) => {
            state.stats.notifications += 1;
            let _ = uart.send(data.clone());
            let _ = notify.send(Notification::UartRx { port, data });
        }
    }
}

/// Transport that talks to the coprocessor through one byte stream per GPIO
/// port and drives the indicator LEDs through sysfs brightness files.
///
/// Must be constructed inside a tokio runtime; each port spawns a reader and
/// a writer task.
pub struct SocketTransport {
    links: HashMap<PortName, Arc<PortLink>>,
    leds: Vec<PathBuf>,
    notify: broadcast::Sender<Notification>,
    pwm_period: Mutex<Option<u16>>,
    i2c_enabled: Mutex<HashSet<PortName>>,
}

impl SocketTransport {
    /// Wraps already-open streams. Ports without a stream report
    /// [`TransportError::NoSocket`].
    pub fn from_streams<S>(streams: Vec<(PortName, S)>, leds: Vec<PathBuf>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (notify, _) = broadcast::channel(NOTIFICATION_CAPACITY);
        let links = streams
            .into_iter()
            .filter(|(port, _)| port.is_gpio())
            .map(|(port, stream)| (port, PortLink::spawn(port, stream, notify.clone())))
            .collect();
        Self {
            links,
            leds,
            notify,
            pwm_period: Mutex::new(None),
            i2c_enabled: Mutex::new(HashSet::new()),
        }
    }

    /// Connects to the bridge daemon's Unix domain sockets.
    #[cfg(unix)]
    pub async fn connect_unix(
        port_a: impl AsRef<Path>,
        port_b: impl AsRef<Path>,
        leds: Vec<PathBuf>,
    ) -> Result<Self, TransportError> {
        let a = tokio::net::UnixStream::connect(port_a.as_ref()).await?;
        let b = tokio::net::UnixStream::connect(port_b.as_ref()).await?;
        tracing::info!("Connected to bridge sockets {:?} and {:?}", port_a.as_ref(), port_b.as_ref());
        Ok(Self::from_streams(vec![(PortName::A, a), (PortName::B, b)], leds))
    }

    /// Opens the ports as serial devices, for coprocessors attached over USB.
    pub fn open_serial(
        port_a: impl AsRef<Path>,
        port_b: impl AsRef<Path>,
        baud: u32,
        leds: Vec<PathBuf>,
    ) -> Result<Self, TransportError> {
        let a = serial2_tokio::SerialPort::open(port_a.as_ref(), baud)?;
        let b = serial2_tokio::SerialPort::open(port_b.as_ref(), baud)?;
        tracing::info!("Opened bridge serial ports {:?} and {:?} at {} baud", port_a.as_ref(), port_b.as_ref(), baud);
        Ok(Self::from_streams(vec![(PortName::A, a), (PortName::B, b)], leds))
    }

    pub fn stats(&self, port: PortName) -> Option<BridgeStats> {
        self.links.get(&port).map(|link| lock(&link.state).stats.clone())
    }

    fn link(&self, port: PortName) -> Result<&Arc<PortLink>, TransportError> {
        self.links.get(&port).ok_or(TransportError::NoSocket(port))
    }

    fn set_led(&self, index: u8, high: bool) -> Result<(), TransportError> {
        let path = self
            .leds
            .get(index as usize)
            .ok_or_else(|| TransportError::Unsupported(format!("no LED file for L{}", index)))?;
        std::fs::write(path, if high { "1" } else { "0" })?;
        Ok(())
    }
}

impl Transport for SocketTransport {
    fn cork(&self, port: PortName) {
        if let Some(link) = self.links.get(&port) {
            link.cork();
        }
    }

    fn uncork(&self, port: PortName) {
        if let Some(link) = self.links.get(&port) {
            link.uncork();
        }
    }

    fn write(&self, port: PortName, frame: &[u8]) -> Result<(), TransportError> {
        self.link(port)?.write(frame)
    }

    fn exchange(&self, port: PortName, frame: &[u8], size: usize) -> PendingReply {
        match self.link(port) {
            Ok(link) => link.exchange(frame, size),
            Err(e) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Err(e));
                rx
            }
        }
    }

    fn configure_input(&self, line: Line) -> Result<(), TransportError> {
        self.link(line.port)?.write(&protocol::gpio_input(line.index))
    }

    fn configure_output(&self, line: Line) -> Result<(), TransportError> {
        match line.port {
            PortName::L => Ok(()),
            port => self.link(port)?.write(&protocol::gpio_level(line.index, false)),
        }
    }

    fn set_pull(&self, line: Line, pull: Pull) -> Result<(), TransportError> {
        self.link(line.port)?.write(&protocol::gpio_pull(line.index, pull))
    }

    fn write_level(&self, line: Line, high: bool) -> Result<(), TransportError> {
        match line.port {
            PortName::L => self.set_led(line.index, high),
            port => self.link(port)?.write(&protocol::gpio_level(line.index, high)),
        }
    }

    fn pwm_duty_cycle(&self, line: Line, duty: f64) -> Result<(), TransportError> {
        let period = (*lock(&self.pwm_period))
            .ok_or_else(|| TransportError::Unsupported("PWM frequency has not been set".to_string()))?;
        self.link(line.port)?
            .write(&protocol::pwm_duty_cycle(line.index, duty, period))
    }

    fn pwm_frequency(&self, hz: u32) -> Result<(), TransportError> {
        let (prescaler, period) = protocol::pwm_timing(hz)
            .ok_or_else(|| TransportError::Unsupported(format!("PWM frequency {} Hz", hz)))?;
        // The carrier is shared; the frame may go out on either socket.
        self.link(PortName::A)?
            .write(&protocol::pwm_period(prescaler, period))?;
        *lock(&self.pwm_period) = Some(period);
        Ok(())
    }

    fn set_interrupt(&self, line: Line, trigger: Option<Trigger>) -> Result<(), TransportError> {
        self.link(line.port)?
            .write(&protocol::gpio_interrupt(line.index, trigger))
    }

    fn open_i2c(&self, port: PortName, address: u8) -> Result<Arc<dyn I2cDevice>, TransportError> {
        let link = self.link(port)?.clone();
        if lock(&self.i2c_enabled).insert(port) {
            link.write(&protocol::i2c_enable(I2C_FREQUENCY_HZ))?;
            tracing::debug!("Enabled I2C on port {}", port);
        }
        Ok(Arc::new(BridgeI2c { link, address }))
    }

    fn open_uart(&self, port: PortName, config: &UartConfig) -> Result<Arc<dyn UartChannel>, TransportError> {
        let link = self.link(port)?.clone();
        link.write(&protocol::uart_enable(config))?;
        let rx = tokio::sync::Mutex::new(link.uart_rx.subscribe());
        Ok(Arc::new(BridgeUart { link, rx }))
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notify.subscribe()
    }
}

struct BridgeI2c {
    link: Arc<PortLink>,
    address: u8,
}

impl BridgeI2c {
    /// Start condition plus the payload frames of a write, as one chunk.
    fn write_frames(&self, data: &[u8]) -> Vec<u8> {
        let mut chunk = protocol::start(self.address, false).to_vec();
        for frame in protocol::tx(data) {
            chunk.extend_from_slice(&frame);
        }
        chunk
    }
}

#[async_trait]
impl I2cDevice for BridgeI2c {
    fn address(&self) -> u8 {
        self.address
    }

    fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut chunk = self.write_frames(data);
        chunk.extend_from_slice(&protocol::stop());
        self.link.write(&chunk)
    }

    async fn transfer(&self, tx: &[u8], rx_len: usize) -> Result<Vec<u8>, TransportError> {
        let len = u8::try_from(rx_len)
            .map_err(|_| TransportError::Unsupported(format!("I2C read of {} bytes", rx_len)))?;
        // The whole transaction leaves as one chunk so no other frame lands
        // between the start condition and the stop.
        let mut chunk = if tx.is_empty() { Vec::new() } else { self.write_frames(tx) };
        chunk.extend_from_slice(&protocol::start(self.address, true));
        chunk.extend_from_slice(&protocol::rx(len));
        chunk.extend_from_slice(&protocol::stop());
        match self.link.exchange(&chunk, rx_len).await.map_err(|_| TransportError::Closed)?? {
            Reply::Data(data) => Ok(data),
            Reply::Status(status) => Err(TransportError::UnexpectedReply(status)),
        }
    }
}

struct BridgeUart {
    link: Arc<PortLink>,
    rx: tokio::sync::Mutex<broadcast::Receiver<Vec<u8>>>,
}

#[async_trait]
impl UartChannel for BridgeUart {
    fn write(&self, data: &[u8]) -> Result<(), TransportError> {
        self.link.write(&protocol::tx(data).concat())
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(data) => return Ok(data),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("UART on port {} dropped {} chunks", self.link.port, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    fn disable(&self) -> Result<(), TransportError> {
        self.link.write(&protocol::uart_disable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_digital_exchange_over_stream() {
        let (host, mut device) = duplex(64);
        let transport = SocketTransport::from_streams(vec![(PortName::A, host)], Vec::new());

        transport.cork(PortName::A);
        let pending = transport.exchange(PortName::A, &protocol::gpio_in(3), 0);
        transport.uncork(PortName::A);

        let mut frame = [0u8; 2];
        device.read_exact(&mut frame).await.unwrap();
        assert_eq!(frame, [protocol::cmd::GPIO_IN, 3]);

        // A pin change arriving first must not be taken as the reply
        let mut notifications = transport.notifications();
        device.write_all(&[0xCA, reply::HIGH]).await.unwrap();
        assert_eq!(pending.await.unwrap(), Ok(Reply::Status(reply::HIGH)));
        assert_eq!(
            notifications.recv().await.unwrap(),
            Notification::PinChange { line: Line::new(PortName::A, 2), level: true }
        );
    }

    #[tokio::test]
    async fn test_closed_socket_fails_pending() {
        let (host, device) = duplex(64);
        let transport = SocketTransport::from_streams(vec![(PortName::B, host)], Vec::new());
        let pending = transport.exchange(PortName::B, &protocol::analog_read(1), 2);
        drop(device);
        assert_eq!(pending.await.unwrap(), Err(TransportError::Closed));
        assert!(matches!(
            transport.write(PortName::A, &[0]),
            Err(TransportError::NoSocket(PortName::A))
        ));
    }

    #[tokio::test]
    async fn test_i2c_transfer_leaves_as_one_chunk() {
        let (host, mut device) = duplex(64);
        let transport = SocketTransport::from_streams(vec![(PortName::A, host)], Vec::new());
        let i2c = transport.open_i2c(PortName::A, 0x48).unwrap();

        let mut enable = [0u8; 2];
        device.read_exact(&mut enable).await.unwrap();
        assert_eq!(enable, protocol::i2c_enable(I2C_FREQUENCY_HZ));

        let read = tokio::spawn(async move { i2c.transfer(&[0x01], 2).await });
        let mut expected = protocol::start(0x48, false).to_vec();
        expected.extend_from_slice(&[protocol::cmd::TX, 1, 0x01]);
        expected.extend_from_slice(&protocol::start(0x48, true));
        expected.extend_from_slice(&protocol::rx(2));
        expected.extend_from_slice(&protocol::stop());
        let mut chunk = vec![0u8; expected.len()];
        device.read_exact(&mut chunk).await.unwrap();
        assert_eq!(chunk, expected);

        device.write_all(&[reply::DATA, 0xAB, 0xCD]).await.unwrap();
        assert_eq!(read.await.unwrap(), Ok(vec![0xAB, 0xCD]));
        assert_eq!(transport.stats(PortName::A).unwrap().replies, 1);
    }
}

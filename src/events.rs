//! Value and event fan-out.
//!
//! Listeners are keyed by a typed [`Channel`] rather than a formatted event
//! name. A listener is either a callback (persistent or one-shot) or an async
//! stream created by [`Emitter::subscribe`].

use futures_core::Stream;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

use crate::address::PortName;
use crate::error::TransportError;
use crate::lock;

/// Publish/subscribe key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Connect,
    Ready,
    /// Board-wide channel for failures of asynchronous exchanges
    Error,
    DigitalRead(usize),
    AnalogRead(usize),
    PinChange(usize),
    I2cReply { address: u8, register: Option<u8> },
    SerialData(PortName),
}

/// Value delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Unit,
    Value(u16),
    Bytes(Vec<u8>),
    Error(TransportError),
}

impl Payload {
    pub fn value(&self) -> Option<u16> {
        match self {
            Payload::Value(value) => Some(*value),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Payload::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&TransportError> {
        match self {
            Payload::Error(e) => Some(e),
            _ => None,
        }
    }
}

pub type Callback = Box<dyn FnMut(&Payload) + Send>;

struct Listener {
    once: bool,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    listeners: HashMap<Channel, Vec<Listener>>,
    streams: HashMap<Channel, Vec<mpsc::UnboundedSender<Payload>>>,
    // Bumped by remove_all so an emission in flight does not restore
    // listeners removed from inside a callback.
    generation: HashMap<Channel, u64>,
    // One-time channels that already fired, with the payload they carried
    latched: HashMap<Channel, Payload>,
}

/// Listener registry. Callbacks run on the emitting task with no lock held,
/// so they may register or remove listeners themselves.
#[derive(Default)]
pub struct Emitter {
    registry: Mutex<Registry>,
}

impl Emitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, channel: Channel, callback: impl FnMut(&Payload) + Send + 'static) {
        self.add(channel, false, Box::new(callback));
    }

    pub fn once(&self, channel: Channel, callback: impl FnMut(&Payload) + Send + 'static) {
        self.add(channel, true, Box::new(callback));
    }

    fn add(&self, channel: Channel, once: bool, mut callback: Callback) {
        let payload = {
            let mut registry = lock(&self.registry);
            match registry.latched.get(&channel) {
                Some(payload) => payload.clone(),
                None => {
                    registry
                        .listeners
                        .entry(channel)
                        .or_default()
                        .push(Listener { once, callback });
                    return;
                }
            }
        };
        // Late registration on a latched channel fires right away
        callback(&payload);
        if !once {
            lock(&self.registry)
                .listeners
                .entry(channel)
                .or_default()
                .push(Listener { once, callback });
        }
    }

    /// Async stream of every payload emitted on `channel` from now on. The
    /// subscription ends when the stream is dropped.
    pub fn subscribe(&self, channel: Channel) -> impl Stream<Item = Payload> + Send + 'static {
        let (tx, mut rx) = mpsc::unbounded_channel();
        lock(&self.registry).streams.entry(channel).or_default().push(tx);
        async_stream::stream! {
            while let Some(payload) = rx.recv().await {
                yield payload;
            }
        }
    }

    /// Delivers `payload` and returns the number of listeners reached.
    pub fn emit(&self, channel: Channel, payload: Payload) -> usize {
        self.deliver(channel, payload, false)
    }

    /// Emits on a channel that fires once in the emitter's lifetime. Callbacks
    /// registered afterwards are invoked immediately with the same payload.
    pub fn emit_latched(&self, channel: Channel, payload: Payload) -> usize {
        self.deliver(channel, payload, true)
    }

    pub fn is_latched(&self, channel: Channel) -> bool {
        lock(&self.registry).latched.contains_key(&channel)
    }

    fn deliver(&self, channel: Channel, payload: Payload, latch: bool) -> usize {
        let mut delivered = 0;
        let (mut taken, generation) = {
            let mut registry = lock(&self.registry);
            if latch {
                registry.latched.insert(channel, payload.clone());
            }
            if let Some(streams) = registry.streams.get_mut(&channel) {
                streams.retain(|tx| tx.send(payload.clone()).is_ok());
                delivered = streams.len();
            }
            let taken = registry.listeners.remove(&channel).unwrap_or_default();
            let generation = registry.generation.get(&channel).copied().unwrap_or(0);
            (taken, generation)
        };
        if taken.is_empty() {
            return delivered;
        }

        for listener in taken.iter_mut() {
            (listener.callback)(&payload);
            delivered += 1;
        }
        taken.retain(|listener| !listener.once);

        let mut registry = lock(&self.registry);
        if !taken.is_empty() && registry.generation.get(&channel).copied().unwrap_or(0) == generation {
            let added = registry.listeners.remove(&channel).unwrap_or_default();
            taken.extend(added);
            registry.listeners.insert(channel, taken);
        }
        delivered
    }

    pub fn remove_all(&self, channel: Channel) {
        let mut registry = lock(&self.registry);
        registry.listeners.remove(&channel);
        registry.streams.remove(&channel);
        *registry.generation.entry(channel).or_default() += 1;
    }

    pub fn listener_count(&self, channel: Channel) -> usize {
        let registry = lock(&self.registry);
        let callbacks = registry.listeners.get(&channel).map_or(0, Vec::len);
        let streams = registry
            .streams
            .get(&channel)
            .map_or(0, |streams| streams.iter().filter(|tx| !tx.is_closed()).count());
        callbacks + streams
    }
}

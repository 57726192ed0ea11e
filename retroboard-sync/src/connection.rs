//! Connection lifecycle per shared resource.
//!
//! ```text
//!              open                  ack
//! Disconnected ────► Connecting ───────────► Connected
//!      ▲              ▲   │  ▲                   │
//!      │  manual      │   │  └── backoff ◄───────┘ drop (retry_count += 1)
//!      └─ reconnect ──┘   │      ▲
//!         failed / close  └──────┘ automatic attempt failed
//! ```
//!
//! One supervisor task owns each channel. Handles are reference counted: the
//! channel lives while at least one [`ConnectionHandle`] for the resource is
//! open, and the supervisor exits when the last one closes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::ReconnectConfig;
use crate::model::ResourceId;
use crate::protocol::ChannelMessage;
use crate::transport::{Channel, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn disconnected() -> Self {
        Self { status: ConnectionStatus::Disconnected, retry_count: 0, last_error: None }
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectionError {
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    Closed,
    #[error("outgoing queue is full")]
    QueueFull,
    #[error("connect attempt timed out")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

enum Control {
    Reconnect(oneshot::Sender<Result<(), ConnectionError>>),
    Close,
}

type Registry = Arc<Mutex<HashMap<ResourceId, Arc<Shared>>>>;

struct Shared {
    resource: ResourceId,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ChannelMessage>,
    outgoing: Mutex<Option<mpsc::Sender<ChannelMessage>>>,
    control: mpsc::UnboundedSender<Control>,
    refs: AtomicUsize,
}

impl Shared {
    fn publish(&self, status: ConnectionStatus, retry_count: u32, last_error: Option<String>) {
        let next = ConnectionState { status, retry_count, last_error };
        self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    fn set_outgoing(&self, sender: Option<mpsc::Sender<ChannelMessage>>) {
        *self.outgoing.lock().unwrap_or_else(PoisonError::into_inner) = sender;
    }

    fn send(&self, msg: ChannelMessage) -> Result<(), ConnectionError> {
        let guard = self.outgoing.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(ConnectionError::NotConnected)?;
        sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::NotConnected,
        })
    }
}

/// Non-owning view of a channel, for components that ride on a connection
/// without keeping it open.
#[derive(Clone)]
pub struct ChannelPort {
    shared: Arc<Shared>,
}

impl ChannelPort {
    pub fn resource(&self) -> &ResourceId {
        &self.shared.resource
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Incoming messages (everything except transport keepalives).
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.shared.events.subscribe()
    }

    /// Best-effort send; fails while not connected.
    pub fn send(&self, msg: ChannelMessage) -> Result<(), ConnectionError> {
        self.shared.send(msg)
    }
}

/// Owning handle to a resource's channel.
pub struct ConnectionHandle {
    port: ChannelPort,
    registry: Registry,
    released: AtomicBool,
}

impl ConnectionHandle {
    pub fn resource(&self) -> &ResourceId {
        self.port.resource()
    }

    pub fn state(&self) -> ConnectionState {
        self.port.state()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.port.watch_state()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.port.subscribe()
    }

    pub fn send(&self, msg: ChannelMessage) -> Result<(), ConnectionError> {
        self.port.send(msg)
    }

    pub fn port(&self) -> ChannelPort {
        self.port.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Abort any pending wait and connect now. Resolves on ack or failure.
    pub async fn reconnect(&self) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::Closed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.port
            .shared
            .control
            .send(Control::Reconnect(reply_tx))
            .map_err(|_| ConnectionError::Closed)?;
        reply_rx.await.unwrap_or(Err(ConnectionError::Closed))
    }

    /// Release this handle. Idempotent; the channel is torn down with the last handle.
    pub fn close(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = &self.port.shared;
        let mut open = self.registry.lock().unwrap_or_else(PoisonError::into_inner);
        if shared.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            if open.get(&shared.resource).is_some_and(|s| Arc::ptr_eq(s, shared)) {
                open.remove(&shared.resource);
            }
            let _ = shared.control.send(Control::Close);
            log::info!("Closing channel for {}", shared.resource);
        }
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens and shares subscription channels.
pub struct ConnectionManager<T: Transport> {
    transport: Arc<T>,
    config: ReconnectConfig,
    capacity: usize,
    open: Registry,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: Arc<T>, config: ReconnectConfig, capacity: usize) -> Self {
        Self {
            transport,
            config,
            capacity: capacity.max(1),
            open: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Open (or share) the channel for `resource`. Must run inside a tokio runtime.
    pub fn open(&self, resource: &ResourceId) -> ConnectionHandle {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(shared) = open.get(resource) {
            shared.refs.fetch_add(1, Ordering::SeqCst);
            return self.handle(shared.clone());
        }

        let (state, _) = watch::channel(ConnectionState {
            status: ConnectionStatus::Connecting,
            retry_count: 0,
            last_error: None,
        });
        let (events, _) = broadcast::channel(self.capacity);
        let (control, control_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            resource: resource.clone(),
            state,
            events,
            outgoing: Mutex::new(None),
            control,
            refs: AtomicUsize::new(1),
        });
        open.insert(resource.clone(), shared.clone());

        let supervisor = Supervisor {
            shared: shared.clone(),
            transport: self.transport.clone(),
            config: self.config.clone(),
            control: control_rx,
            replies: Vec::new(),
            retry: 0,
            last_error: None,
        };
        tokio::spawn(supervisor.run());
        log::info!("Opening channel for {resource}");
        self.handle(shared)
    }

    fn handle(&self, shared: Arc<Shared>) -> ConnectionHandle {
        ConnectionHandle {
            port: ChannelPort { shared },
            registry: self.open.clone(),
            released: AtomicBool::new(false),
        }
    }

    pub fn close(&self, handle: &ConnectionHandle) {
        handle.close();
    }

    pub async fn reconnect(&self, handle: &ConnectionHandle) -> Result<(), ConnectionError> {
        handle.reconnect().await
    }

    pub fn state(&self, handle: &ConnectionHandle) -> ConnectionState {
        handle.state()
    }

    pub fn is_open(&self, resource: &ResourceId) -> bool {
        self.open.lock().unwrap_or_else(PoisonError::into_inner).contains_key(resource)
    }

    /// Number of live handles for `resource`.
    pub fn handle_count(&self, resource: &ResourceId) -> usize {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(resource)
            .map_or(0, |s| s.refs.load(Ordering::SeqCst))
    }
}

enum Phase {
    Attempt { manual: bool },
    Backoff,
    Idle,
}

enum PumpExit {
    Dropped,
    Reconnect,
    Close,
}

struct Supervisor<T: Transport> {
    shared: Arc<Shared>,
    transport: Arc<T>,
    config: ReconnectConfig,
    control: mpsc::UnboundedReceiver<Control>,
    replies: Vec<oneshot::Sender<Result<(), ConnectionError>>>,
    retry: u32,
    last_error: Option<String>,
}

impl<T: Transport> Supervisor<T> {
    async fn run(mut self) {
        let mut phase = Phase::Attempt { manual: false };
        loop {
            phase = match phase {
                Phase::Attempt { manual } => match self.attempt(manual).await {
                    Some(next) => next,
                    None => break,
                },
                Phase::Backoff => {
                    let delay = self.config.delay_for(self.retry);
                    log::debug!(
                        "Retrying {} in {:?} (attempt {})",
                        self.shared.resource,
                        delay,
                        self.retry
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => Phase::Attempt { manual: false },
                        control = self.control.recv() => match self.on_control(control) {
                            Some(next) => next,
                            None => break,
                        },
                    }
                }
                Phase::Idle => {
                    let control = self.control.recv().await;
                    match self.on_control(control) {
                        Some(next) => next,
                        None => break,
                    }
                }
            };
        }

        self.shared.set_outgoing(None);
        self.publish(ConnectionStatus::Disconnected);
        for reply in self.replies.drain(..) {
            let _ = reply.send(Err(ConnectionError::Closed));
        }
        log::info!("Channel for {} closed", self.shared.resource);
    }

    fn publish(&self, status: ConnectionStatus) {
        self.shared.publish(status, self.retry, self.last_error.clone());
    }

    fn on_control(&mut self, control: Option<Control>) -> Option<Phase> {
        match control {
            Some(Control::Reconnect(reply)) => {
                self.replies.push(reply);
                Some(Phase::Attempt { manual: true })
            }
            Some(Control::Close) | None => None,
        }
    }

    /// One connect attempt. `None` means the supervisor should stop.
    async fn attempt(&mut self, manual: bool) -> Option<Phase> {
        self.publish(ConnectionStatus::Connecting);
        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&self.shared.resource),
        );
        let result = tokio::select! {
            result = connect => result,
            control = self.control.recv() => return self.on_control(control),
        };

        let error = match result {
            Ok(Ok(channel)) => {
                self.retry = 0;
                self.last_error = None;
                self.publish(ConnectionStatus::Connected);
                log::info!("Connected to {}", self.shared.resource);
                for reply in self.replies.drain(..) {
                    let _ = reply.send(Ok(()));
                }
                return match self.pump(channel).await {
                    PumpExit::Dropped => {
                        self.retry += 1;
                        self.last_error = Some("connection lost".to_string());
                        log::warn!("Lost connection to {}", self.shared.resource);
                        self.publish(ConnectionStatus::Connecting);
                        Some(Phase::Backoff)
                    }
                    PumpExit::Reconnect => Some(Phase::Attempt { manual: true }),
                    PumpExit::Close => None,
                };
            }
            Ok(Err(e)) => ConnectionError::Transport(e),
            Err(_) => ConnectionError::Timeout,
        };

        self.last_error = Some(error.to_string());
        if manual {
            log::warn!("Reconnect to {} failed: {error}", self.shared.resource);
            self.publish(ConnectionStatus::Disconnected);
            for reply in self.replies.drain(..) {
                let _ = reply.send(Err(error.clone()));
            }
            Some(Phase::Idle)
        } else {
            self.retry += 1;
            log::warn!("Connect to {} failed: {error}", self.shared.resource);
            self.publish(ConnectionStatus::Connecting);
            Some(Phase::Backoff)
        }
    }

    async fn pump(&mut self, channel: Channel) -> PumpExit {
        let Channel { outgoing, mut incoming } = channel;
        self.shared.set_outgoing(Some(outgoing.clone()));

        let exit = loop {
            tokio::select! {
                msg = incoming.recv() => match msg {
                    Some(ChannelMessage::Ping) => {
                        let _ = outgoing.try_send(ChannelMessage::Pong);
                    }
                    Some(ChannelMessage::Subscribe { .. }) | Some(ChannelMessage::Ack { .. }) => {}
                    Some(msg) => {
                        log::trace!("{} <- {}", self.shared.resource, msg.kind());
                        let _ = self.shared.events.send(msg);
                    }
                    None => break PumpExit::Dropped,
                },
                control = self.control.recv() => match control {
                    Some(Control::Reconnect(reply)) => {
                        self.replies.push(reply);
                        break PumpExit::Reconnect;
                    }
                    Some(Control::Close) | None => break PumpExit::Close,
                },
            }
        };

        self.shared.set_outgoing(None);
        exit
    }
}

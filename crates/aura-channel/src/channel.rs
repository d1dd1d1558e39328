//! Physical Channel Contracts
//!
//! The channel layer never performs I/O itself. Transports plug in by
//! implementing [`Channel`] plus whichever shape capabilities they support
//! ([`OutputChannel`], [`InputChannel`], [`RequestChannel`],
//! [`ReplyChannel`]), and a [`ChannelFactory`] when the binder is allowed to
//! create replacement channels.

use crate::error::ChannelResult;
use crate::lifecycle::CommunicationState;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked when a channel faults
pub type FaultListener = Arc<dyn Fn() + Send + Sync>;

/// Handle identifying a registered [`FaultListener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Result of a receive attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveOutcome<T> {
    /// An item arrived
    Message(T),
    /// The source reached end of input; no more items will arrive on it
    Closed,
    /// Nothing arrived within the budget
    TimedOut,
}

impl<T> ReceiveOutcome<T> {
    /// Returns the item, if any
    pub fn into_message(self) -> Option<T> {
        match self {
            Self::Message(message) => Some(message),
            _ => None,
        }
    }

    /// Returns true if an item arrived
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message(_))
    }

    /// Transform the carried item
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ReceiveOutcome<U> {
        match self {
            Self::Message(message) => ReceiveOutcome::Message(f(message)),
            Self::Closed => ReceiveOutcome::Closed,
            Self::TimedOut => ReceiveOutcome::TimedOut,
        }
    }
}

/// A physical channel with its own lifecycle
#[async_trait]
pub trait Channel: Send + Sync + 'static {
    /// Message type carried by the channel
    type Message: Send + 'static;

    /// Current lifecycle state
    fn state(&self) -> CommunicationState;

    /// Open the channel within `timeout`
    async fn open(&self, timeout: Duration) -> ChannelResult<()>;

    /// Close the channel gracefully within `timeout`
    async fn close(&self, timeout: Duration) -> ChannelResult<()>;

    /// Release the channel immediately
    fn abort(&self);

    /// Register a callback fired once when the channel faults
    fn subscribe_faulted(&self, listener: FaultListener) -> ListenerId;

    /// Remove a callback registered with [`Channel::subscribe_faulted`]
    fn unsubscribe_faulted(&self, id: ListenerId);

    /// Whether the channel carries a security session
    fn is_security_session(&self) -> bool {
        false
    }
}

/// Channel that can send one-way messages
#[async_trait]
pub trait OutputChannel: Channel {
    /// Send `message` within `timeout`
    async fn send(&self, message: Self::Message, timeout: Duration) -> ChannelResult<()>;
}

/// Channel that can receive one-way messages
#[async_trait]
pub trait InputChannel: Channel {
    /// Wait up to `timeout` for the next message
    async fn try_receive(&self, timeout: Duration) -> ChannelResult<ReceiveOutcome<Self::Message>>;
}

/// Channel that sends and receives on the same session
pub trait DuplexChannel: OutputChannel + InputChannel {}

impl<C: OutputChannel + InputChannel> DuplexChannel for C {}

/// Client side of a request/reply exchange
#[async_trait]
pub trait RequestChannel: Channel {
    /// Send `message` and wait for its reply within `timeout`
    async fn request(&self, message: Self::Message, timeout: Duration)
        -> ChannelResult<Self::Message>;
}

/// Server side of a request/reply exchange
#[async_trait]
pub trait ReplyChannel: Channel {
    /// Context used to reply to a received request
    type Context: RequestContext<Message = Self::Message>;

    /// Wait up to `timeout` for the next request
    async fn try_receive_request(
        &self,
        timeout: Duration,
    ) -> ChannelResult<ReceiveOutcome<Self::Context>>;
}

/// An inbound request awaiting its reply
#[async_trait]
pub trait RequestContext: Send + Sync + 'static {
    /// Message type of request and reply
    type Message: Send + 'static;

    /// The request that was received
    fn request_message(&self) -> &Self::Message;

    /// Send the reply within `timeout`
    async fn reply(&self, message: Self::Message, timeout: Duration) -> ChannelResult<()>;

    /// Complete the exchange without replying
    async fn close(&self, timeout: Duration) -> ChannelResult<()>;

    /// Drop the exchange immediately
    fn abort(&self);
}

/// Source of fresh physical channels
#[async_trait]
pub trait ChannelFactory<C: Channel>: Send + Sync {
    /// Obtain a channel within `timeout`
    ///
    /// Returns `None` when no channel can be produced (e.g. the factory is
    /// shutting down). The channel may be returned unopened; the caller opens
    /// it.
    async fn try_get_channel(&self, timeout: Duration) -> ChannelResult<Option<Arc<C>>>;

    /// Whether channels from this factory carry a security session
    fn creates_security_sessions(&self) -> bool {
        false
    }
}

#[derive(Default)]
struct NotifierState {
    next_id: u64,
    listeners: Vec<(ListenerId, FaultListener)>,
    fired: bool,
}

/// Listener registry backing [`Channel::subscribe_faulted`]
///
/// Listeners are invoked outside the registry lock, at most once.
#[derive(Default)]
pub struct FaultNotifier {
    inner: Mutex<NotifierState>,
}

impl fmt::Debug for FaultNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("FaultNotifier")
            .field("listeners", &inner.listeners.len())
            .field("fired", &inner.fired)
            .finish()
    }
}

impl FaultNotifier {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`
    pub fn subscribe(&self, listener: FaultListener) -> ListenerId {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Remove the listener registered as `id`
    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner.lock().listeners.retain(|(listener, _)| *listener != id);
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Invoke every registered listener, only on the first call
    ///
    /// Returns the number of listeners invoked.
    pub fn notify(&self) -> usize {
        let listeners: Vec<FaultListener> = {
            let mut inner = self.inner.lock();
            if inner.fired {
                return 0;
            }
            inner.fired = true;
            inner
                .listeners
                .iter()
                .map(|(_, listener)| listener.clone())
                .collect()
        };

        for listener in &listeners {
            listener();
        }
        listeners.len()
    }
}

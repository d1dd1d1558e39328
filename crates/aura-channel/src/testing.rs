//! In-memory channels for tests
//!
//! [`MockChannel`] implements every channel shape on top of a
//! [`CommunicationObject`], with scripted failures and operation counters.
//! [`MockChannelFactory`] produces them on demand.

use crate::channel::{
    Channel, ChannelFactory, FaultListener, FaultNotifier, InputChannel, ListenerId,
    OutputChannel, ReceiveOutcome, ReplyChannel, RequestChannel, RequestContext,
};
use crate::deadline::Deadline;
use crate::error::{ChannelError, ChannelErrorBuilder, ChannelResult};
use crate::lifecycle::{CommunicationObject, CommunicationState, LifecycleHandler};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct Script {
    open_failure: Option<ChannelError>,
    send_failures: VecDeque<ChannelError>,
    receive_failures: VecDeque<ChannelError>,
}

/// In-memory channel carrying `String` messages
pub struct MockChannel {
    lifecycle: CommunicationObject,
    notifier: FaultNotifier,
    inbox: Mutex<VecDeque<String>>,
    arrivals: Notify,
    end_of_input: AtomicBool,
    outbox: Arc<Mutex<Vec<String>>>,
    script: Mutex<Script>,
    open_delay: Duration,
    security_session: bool,
    opens: AtomicUsize,
    closes: AtomicUsize,
    aborts: AtomicUsize,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("name", &self.lifecycle.object())
            .field("state", &self.lifecycle.state())
            .finish()
    }
}

impl MockChannel {
    /// Create an unopened channel
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            lifecycle: CommunicationObject::new(name),
            notifier: FaultNotifier::new(),
            inbox: Mutex::new(VecDeque::new()),
            arrivals: Notify::new(),
            end_of_input: AtomicBool::new(false),
            outbox: Arc::new(Mutex::new(Vec::new())),
            script: Mutex::new(Script::default()),
            open_delay: Duration::ZERO,
            security_session: false,
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            aborts: AtomicUsize::new(0),
        }
    }

    /// Delay every open by `delay`
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Fail the open with `error`
    pub fn with_open_failure(self, error: ChannelError) -> Self {
        self.script.lock().open_failure = Some(error);
        self
    }

    /// Report the channel as carrying a security session
    pub fn with_security_session(mut self) -> Self {
        self.security_session = true;
        self
    }

    /// Name given at construction
    pub fn name(&self) -> &str {
        self.lifecycle.object()
    }

    /// Queue an inbound message
    pub fn push_message(&self, message: impl Into<String>) {
        self.inbox.lock().push_back(message.into());
        self.arrivals.notify_waiters();
    }

    /// Report end of input once the queued messages are consumed
    pub fn close_input(&self) {
        self.end_of_input.store(true, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }

    /// Fail the next send or request with `error`
    pub fn fail_next_send(&self, error: ChannelError) {
        self.script.lock().send_failures.push_back(error);
    }

    /// Fail the next receive with `error`
    pub fn fail_next_receive(&self, error: ChannelError) {
        self.script.lock().receive_failures.push_back(error);
    }

    /// Fault the channel, notifying fault listeners once
    pub fn fault(&self) {
        self.lifecycle.fault(self);
    }

    /// Messages sent, requests issued and replies written, in order
    pub fn sent_messages(&self) -> Vec<String> {
        self.outbox.lock().clone()
    }

    /// Number of open attempts
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of graceful closes
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Number of aborts
    pub fn abort_count(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }

    /// Number of registered fault listeners
    pub fn listener_count(&self) -> usize {
        self.notifier.listener_count()
    }

    /// A faulted transport reports a reset connection; anything else not
    /// opened reports the lifecycle error
    fn ensure_usable(&self) -> ChannelResult<()> {
        match self.lifecycle.state() {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Faulted => {
                Err(ChannelErrorBuilder::connection_reset(self.name()))
            }
            _ => self.lifecycle.throw_if_disposed_or_not_open(),
        }
    }

    async fn next_message(&self, timeout: Duration) -> ChannelResult<ReceiveOutcome<String>> {
        self.ensure_usable()?;
        if let Some(error) = self.script.lock().receive_failures.pop_front() {
            return Err(error);
        }

        let deadline = Deadline::after(timeout);
        loop {
            let arrived = self.arrivals.notified();
            tokio::pin!(arrived);
            arrived.as_mut().enable();

            if let Some(message) = self.inbox.lock().pop_front() {
                return Ok(ReceiveOutcome::Message(message));
            }
            if self.end_of_input.load(Ordering::SeqCst) {
                return Ok(ReceiveOutcome::Closed);
            }

            match deadline.instant() {
                Some(at) => {
                    if tokio::time::timeout_at(at, arrived).await.is_err() {
                        return Ok(ReceiveOutcome::TimedOut);
                    }
                }
                None => arrived.await,
            }
            self.ensure_usable()?;
        }
    }

    fn record_outbound(&self, message: String) -> ChannelResult<()> {
        self.ensure_usable()?;
        if let Some(error) = self.script.lock().send_failures.pop_front() {
            return Err(error);
        }
        self.outbox.lock().push(message);
        Ok(())
    }
}

#[async_trait]
impl LifecycleHandler for MockChannel {
    async fn on_open(&self, _deadline: Deadline) -> ChannelResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        match self.script.lock().open_failure.clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    async fn on_close(&self, _deadline: Deadline) -> ChannelResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_abort(&self) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.arrivals.notify_waiters();
    }

    fn on_faulted(&self) {
        self.arrivals.notify_waiters();
        self.notifier.notify();
    }
}

#[async_trait]
impl Channel for MockChannel {
    type Message = String;

    fn state(&self) -> CommunicationState {
        self.lifecycle.state()
    }

    async fn open(&self, timeout: Duration) -> ChannelResult<()> {
        self.lifecycle.open(self, timeout).await
    }

    async fn close(&self, timeout: Duration) -> ChannelResult<()> {
        self.lifecycle.close(self, timeout).await
    }

    fn abort(&self) {
        self.lifecycle.abort(self);
    }

    fn subscribe_faulted(&self, listener: FaultListener) -> ListenerId {
        self.notifier.subscribe(listener)
    }

    fn unsubscribe_faulted(&self, id: ListenerId) {
        self.notifier.unsubscribe(id);
    }

    fn is_security_session(&self) -> bool {
        self.security_session
    }
}

#[async_trait]
impl OutputChannel for MockChannel {
    async fn send(&self, message: String, _timeout: Duration) -> ChannelResult<()> {
        self.record_outbound(message)
    }
}

#[async_trait]
impl InputChannel for MockChannel {
    async fn try_receive(&self, timeout: Duration) -> ChannelResult<ReceiveOutcome<String>> {
        self.next_message(timeout).await
    }
}

#[async_trait]
impl RequestChannel for MockChannel {
    /// Echoes the request back as its reply
    async fn request(&self, message: String, _timeout: Duration) -> ChannelResult<String> {
        self.record_outbound(message.clone())?;
        Ok(message)
    }
}

#[async_trait]
impl ReplyChannel for MockChannel {
    type Context = MockRequestContext;

    async fn try_receive_request(
        &self,
        timeout: Duration,
    ) -> ChannelResult<ReceiveOutcome<MockRequestContext>> {
        let outbox = self.outbox.clone();
        Ok(self
            .next_message(timeout)
            .await?
            .map(|request| MockRequestContext::with_outbox(request, outbox)))
    }
}

#[derive(Debug, Default)]
struct ContextState {
    replied: bool,
    closed: bool,
    aborted: bool,
}

/// Request context whose replies land in the originating channel's outbox
#[derive(Debug)]
pub struct MockRequestContext {
    request: String,
    outbox: Arc<Mutex<Vec<String>>>,
    state: Mutex<ContextState>,
}

impl MockRequestContext {
    /// Standalone context with its own outbox
    pub fn new(request: impl Into<String>) -> Self {
        Self::with_outbox(request.into(), Arc::new(Mutex::new(Vec::new())))
    }

    fn with_outbox(request: String, outbox: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            request,
            outbox,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// Replies written through this context
    pub fn replies(&self) -> Vec<String> {
        self.outbox.lock().clone()
    }

    /// Whether a reply was sent
    pub fn replied(&self) -> bool {
        self.state.lock().replied
    }

    /// Whether the exchange was closed
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Whether the exchange was aborted
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }
}

#[async_trait]
impl RequestContext for MockRequestContext {
    type Message = String;

    fn request_message(&self) -> &String {
        &self.request
    }

    async fn reply(&self, message: String, _timeout: Duration) -> ChannelResult<()> {
        {
            let mut state = self.state.lock();
            if state.aborted || state.closed {
                return Err(ChannelError::closed("request context"));
            }
            state.replied = true;
        }
        self.outbox.lock().push(message);
        Ok(())
    }

    async fn close(&self, _timeout: Duration) -> ChannelResult<()> {
        self.state.lock().closed = true;
        Ok(())
    }

    fn abort(&self) {
        self.state.lock().aborted = true;
    }
}

#[derive(Default)]
struct FactoryScript {
    acquire_failures: VecDeque<ChannelError>,
    open_failures: VecDeque<ChannelError>,
    open_delay: Duration,
    exhausted: bool,
}

/// Factory producing fresh [`MockChannel`]s
#[derive(Default)]
pub struct MockChannelFactory {
    script: Mutex<FactoryScript>,
    produced: Mutex<Vec<Arc<MockChannel>>>,
    calls: AtomicUsize,
    security_sessions: bool,
}

impl fmt::Debug for MockChannelFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannelFactory")
            .field("calls", &self.calls())
            .field("produced", &self.produced.lock().len())
            .finish()
    }
}

impl MockChannelFactory {
    /// Create a factory that always succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Produce channels that carry a security session
    pub fn with_security_sessions() -> Self {
        Self {
            security_sessions: true,
            ..Self::default()
        }
    }

    /// Delay opening of channels produced from now on
    pub fn set_open_delay(&self, delay: Duration) {
        self.script.lock().open_delay = delay;
    }

    /// Fail the next acquisition itself with `error`
    pub fn fail_next_acquire(&self, error: ChannelError) {
        self.script.lock().acquire_failures.push_back(error);
    }

    /// The next channel produced fails to open with `error`
    pub fn fail_next_open(&self, error: ChannelError) {
        self.script.lock().open_failures.push_back(error);
    }

    /// Stop producing channels
    pub fn exhaust(&self) {
        self.script.lock().exhausted = true;
    }

    /// Number of acquisition attempts
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every channel produced, oldest first
    pub fn channels(&self) -> Vec<Arc<MockChannel>> {
        self.produced.lock().clone()
    }

    /// The most recently produced channel
    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.produced.lock().last().cloned()
    }
}

#[async_trait]
impl ChannelFactory<MockChannel> for MockChannelFactory {
    async fn try_get_channel(&self, _timeout: Duration) -> ChannelResult<Option<Arc<MockChannel>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);

        let mut channel = {
            let mut script = self.script.lock();
            if let Some(error) = script.acquire_failures.pop_front() {
                return Err(error);
            }
            if script.exhausted {
                return Ok(None);
            }
            let mut channel =
                MockChannel::new(format!("channel-{call}")).with_open_delay(script.open_delay);
            if let Some(error) = script.open_failures.pop_front() {
                channel = channel.with_open_failure(error);
            }
            channel
        };
        if self.security_sessions {
            channel = channel.with_security_session();
        }

        let channel = Arc::new(channel);
        self.produced.lock().push(channel.clone());
        Ok(Some(channel))
    }

    fn creates_security_sessions(&self) -> bool {
        self.security_sessions
    }
}

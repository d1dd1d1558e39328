//! Channel Binder
//!
//! Per-operation facade over a [`ChannelSynchronizer`]. Every operation
//! acquires the shared channel, runs against it, and returns it, then
//! classifies any failure against the caller's [`MaskingMode`]:
//!
//! - handleable faults (communication, timeout) are absorbed under `HANDLED`
//! - everything else is published as [`BinderEvent::UnhandledError`] under
//!   `UNHANDLED`
//! - lifecycle misuse detected before the operation is always returned
//!
//! One generic binder serves every channel shape; the operations available
//! depend on the capabilities of `C`.

mod request_context;

pub use self::request_context::BoundRequestContext;

use crate::channel::{
    Channel, ChannelFactory, InputChannel, OutputChannel, ReceiveOutcome, ReplyChannel,
    RequestChannel, RequestContext,
};
use crate::config::BinderConfig;
use crate::deadline::{within, Deadline};
use crate::error::{ChannelError, ChannelResult};
use crate::lifecycle::{CommunicationObject, CommunicationState, LifecycleHandler};
use crate::masking::MaskingMode;
use crate::synchronizer::{ChannelAcquisition, ChannelSynchronizer, SynchronizerOwner};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const BINDER: &str = "ChannelBinder";

/// Notifications published by a binder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinderEvent {
    /// A tolerated inner fault retired the channel; the next operation reconnects
    ConnectionLost,
    /// The binder faulted
    Faulted,
    /// A failure redirected by `MaskingMode::UNHANDLED`
    UnhandledError(ChannelError),
}

struct BinderInner<C: Channel> {
    lifecycle: CommunicationObject,
    synchronizer: ChannelSynchronizer<C>,
    config: BinderConfig,
    tolerant: bool,
    has_factory: bool,
    events: broadcast::Sender<BinderEvent>,
}

impl<C: Channel> BinderInner<C> {
    fn emit(&self, event: BinderEvent) {
        let _ = self.events.send(event);
    }

    fn abort_channel(&self, close: bool) {
        if let Some(channel) = self.synchronizer.stop_synchronizing(close) {
            channel.abort();
        }
    }
}

#[async_trait]
impl<C: Channel> LifecycleHandler for BinderInner<C> {
    async fn on_open(&self, deadline: Deadline) -> ChannelResult<()> {
        self.synchronizer.start_synchronizing()?;
        if !self.config.connect_on_open || !self.has_factory {
            return Ok(());
        }

        match self
            .synchronizer
            .try_get_channel_for_output(deadline, MaskingMode::NONE)
            .await?
        {
            ChannelAcquisition::Acquired(_) => {
                self.synchronizer.return_channel().await;
                Ok(())
            }
            ChannelAcquisition::TimedOut => Err(deadline.timeout_error("open")),
            ChannelAcquisition::Unavailable => Err(ChannelError::communication(
                "no channel available while opening",
            )),
        }
    }

    async fn on_close(&self, deadline: Deadline) -> ChannelResult<()> {
        self.synchronizer
            .wait_for_pending_operations(deadline)
            .await?;

        let Some(channel) = self.synchronizer.stop_synchronizing(true) else {
            return Ok(());
        };
        if channel.state() != CommunicationState::Opened {
            channel.abort();
            return Ok(());
        }
        if let Err(error) = channel.close(deadline.remaining()).await {
            channel.abort();
            return Err(error);
        }
        Ok(())
    }

    fn on_abort(&self) {
        self.abort_channel(false);
    }

    fn on_faulted(&self) {
        self.abort_channel(false);
        self.emit(BinderEvent::Faulted);
    }
}

impl<C: Channel> SynchronizerOwner for BinderInner<C> {
    fn fault(&self, error: ChannelError) {
        warn!(object = BINDER, error = %error, "Faulting binder");
        self.lifecycle.fault(self);
    }

    fn connection_lost(&self) {
        info!(object = BINDER, "Connection lost");
        self.emit(BinderEvent::ConnectionLost);
    }

    fn terminal_error(&self) -> ChannelError {
        self.lifecycle.terminal_error()
    }
}

/// Returns a held channel if the operation holding it is dropped
struct ChannelLease<C: Channel> {
    synchronizer: ChannelSynchronizer<C>,
    returned: bool,
}

impl<C: Channel> ChannelLease<C> {
    fn new(synchronizer: &ChannelSynchronizer<C>) -> Self {
        Self {
            synchronizer: synchronizer.clone(),
            returned: false,
        }
    }

    async fn release(mut self) {
        self.returned = true;
        self.synchronizer.return_channel().await;
    }
}

impl<C: Channel> Drop for ChannelLease<C> {
    fn drop(&mut self) {
        if !self.returned {
            self.synchronizer.release_detached();
        }
    }
}

/// Facade running send/receive/request operations over a shared channel
pub struct ChannelBinder<C: Channel> {
    inner: Arc<BinderInner<C>>,
}

impl<C: Channel> Clone for ChannelBinder<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Channel> fmt::Debug for ChannelBinder<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBinder")
            .field("state", &self.inner.lifecycle.state())
            .field("tolerant", &self.inner.tolerant)
            .field("synchronizer", &self.inner.synchronizer)
            .finish()
    }
}

impl<C: Channel> ChannelBinder<C> {
    /// Binder that opens channels from `factory` on demand
    pub fn with_factory(
        factory: Arc<dyn ChannelFactory<C>>,
        config: BinderConfig,
    ) -> ChannelResult<Self> {
        config.validate()?;
        let tolerant = config
            .fault_tolerance_mode
            .tolerates(factory.creates_security_sessions());
        Ok(Self::build(Some(factory), None, tolerant, config))
    }

    /// Binder over an existing channel, opened or not
    pub fn with_channel(channel: Arc<C>, config: BinderConfig) -> ChannelResult<Self> {
        config.validate()?;
        let tolerant = config
            .fault_tolerance_mode
            .tolerates(channel.is_security_session());
        Ok(Self::build(None, Some(channel), tolerant, config))
    }

    /// Binder whose channels are handed in through [`ChannelBinder::set_channel`]
    pub fn accepting(config: BinderConfig) -> ChannelResult<Self> {
        config.validate()?;
        let tolerant = config.fault_tolerance_mode.tolerates(false);
        Ok(Self::build(None, None, tolerant, config))
    }

    fn build(
        factory: Option<Arc<dyn ChannelFactory<C>>>,
        channel: Option<Arc<C>>,
        tolerant: bool,
        config: BinderConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let has_factory = factory.is_some();
        let inner = Arc::new_cyclic(|weak: &Weak<BinderInner<C>>| {
            let owner: Weak<dyn SynchronizerOwner> = weak.clone();
            BinderInner {
                lifecycle: CommunicationObject::new(BINDER),
                synchronizer: ChannelSynchronizer::new(
                    BINDER,
                    owner,
                    factory,
                    channel,
                    tolerant,
                    config.close_timeout,
                ),
                config,
                tolerant,
                has_factory,
                events,
            }
        });
        Self { inner }
    }

    /// Current lifecycle state
    pub fn state(&self) -> CommunicationState {
        self.inner.lifecycle.state()
    }

    /// Configuration the binder was built with
    pub fn config(&self) -> &BinderConfig {
        &self.inner.config
    }

    /// Whether inner channel faults are recoverable
    pub fn tolerates_faults(&self) -> bool {
        self.inner.tolerant
    }

    /// The synchronizer arbitrating the shared channel
    pub fn synchronizer(&self) -> &ChannelSynchronizer<C> {
        &self.inner.synchronizer
    }

    /// Subscribe to binder notifications
    pub fn subscribe(&self) -> broadcast::Receiver<BinderEvent> {
        self.inner.events.subscribe()
    }

    /// Open the binder; with `connect_on_open` the first channel is opened too
    pub async fn open(&self, timeout: Duration) -> ChannelResult<()> {
        self.inner.lifecycle.open(self.inner.as_ref(), timeout).await
    }

    /// Open within the configured `open_timeout`
    pub async fn open_default(&self) -> ChannelResult<()> {
        self.open(self.inner.config.open_timeout).await
    }

    /// Drain in-flight operations and close the binder and its channel
    pub async fn close(&self, timeout: Duration) -> ChannelResult<()> {
        self.close_with_masking(timeout, MaskingMode::NONE).await
    }

    /// Close, absorbing a prior fault or a handleable close failure under `HANDLED`
    pub async fn close_with_masking(
        &self,
        timeout: Duration,
        masking: MaskingMode,
    ) -> ChannelResult<()> {
        match self.inner.lifecycle.close(self.inner.as_ref(), timeout).await {
            Err(error)
                if masking.contains(MaskingMode::HANDLED)
                    && (error.is_handleable() || matches!(error, ChannelError::Faulted { .. })) =>
            {
                warn!(object = BINDER, error = %error, "Close failure masked");
                Ok(())
            }
            result => result,
        }
    }

    /// Close within the configured `close_timeout` and default masking
    pub async fn close_default(&self) -> ChannelResult<()> {
        let config = &self.inner.config;
        self.close_with_masking(config.close_timeout, config.default_masking_mode)
            .await
    }

    /// Release the binder and its channel immediately
    pub fn abort(&self) {
        self.inner.lifecycle.abort(self.inner.as_ref());
    }

    /// Fault the binder
    pub fn fault(&self, error: ChannelError) {
        SynchronizerOwner::fault(self.inner.as_ref(), error);
    }

    /// Hand in a channel accepted by a listener
    ///
    /// Returns false if a channel is already installed.
    pub fn set_channel(&self, channel: Arc<C>) -> ChannelResult<bool> {
        self.inner.lifecycle.throw_if_disposed()?;
        Ok(self.inner.synchronizer.set_channel(channel))
    }

    /// Retire the current channel; the next operation opens a replacement
    pub fn abort_current_channel(&self) -> ChannelResult<()> {
        self.inner.lifecycle.throw_if_disposed()?;
        self.inner.synchronizer.abort_current_channel()
    }

    /// Decide whether `error` is swallowed
    ///
    /// Returns true when the error was absorbed or published as
    /// [`BinderEvent::UnhandledError`]; false when the caller must return it.
    pub fn handle_exception(
        &self,
        error: &ChannelError,
        masking: MaskingMode,
        auto_aborted: bool,
    ) -> bool {
        if self.inner.tolerant
            && auto_aborted
            && (error.is_handleable() || matches!(error, ChannelError::Aborted { .. }))
        {
            debug!(object = BINDER, error = %error, "Failure on retired channel absorbed");
            return true;
        }

        if masking.absorbs(error) {
            warn!(object = BINDER, error = %error, "Handled fault masked");
            return true;
        }

        if masking.redirects(error) {
            warn!(object = BINDER, error = %error, "Unhandled fault redirected");
            self.inner
                .emit(BinderEvent::UnhandledError(error.clone()));
            return true;
        }

        false
    }

    fn absorb<T>(
        &self,
        error: ChannelError,
        masking: MaskingMode,
        auto_aborted: bool,
    ) -> ChannelResult<Option<T>> {
        if self.handle_exception(&error, masking, auto_aborted) {
            Ok(None)
        } else {
            Err(error)
        }
    }

    /// Run `operation` against the shared channel, opening one if needed
    ///
    /// `None` means the failure was masked.
    async fn run_output<T, F, Fut>(
        &self,
        name: &'static str,
        timeout: Duration,
        masking: MaskingMode,
        operation: F,
    ) -> ChannelResult<Option<T>>
    where
        F: FnOnce(Arc<C>, Duration) -> Fut,
        Fut: Future<Output = ChannelResult<T>>,
    {
        self.inner.lifecycle.throw_if_disposed_or_not_open()?;
        let deadline = Deadline::after(timeout);

        let acquired = self
            .inner
            .synchronizer
            .try_get_channel_for_output(deadline, masking)
            .await;
        let channel = match acquired {
            Ok(ChannelAcquisition::Acquired(channel)) => channel,
            Ok(ChannelAcquisition::TimedOut) => {
                return self.absorb(deadline.timeout_error(name), masking, false)
            }
            Ok(ChannelAcquisition::Unavailable) if masking.contains(MaskingMode::HANDLED) => {
                return Ok(None)
            }
            Ok(ChannelAcquisition::Unavailable) => {
                return self.absorb(self.inner.lifecycle.terminal_error(), masking, false)
            }
            Err(error) => return self.absorb(error, masking, false),
        };

        let lease = ChannelLease::new(&self.inner.synchronizer);
        let result = within(deadline, name, operation(channel, deadline.remaining())).await;
        let auto_aborted = self.inner.synchronizer.is_aborting();
        lease.release().await;

        match result {
            Ok(value) => Ok(Some(value)),
            Err(error) => self.absorb(error, masking, auto_aborted),
        }
    }

    /// Receive loop shared by message and request receives
    async fn run_input<T, F, Fut>(
        &self,
        name: &'static str,
        timeout: Duration,
        masking: MaskingMode,
        receive: F,
    ) -> ChannelResult<ReceiveOutcome<T>>
    where
        F: Fn(Arc<C>, Duration) -> Fut,
        Fut: Future<Output = ChannelResult<ReceiveOutcome<T>>>,
    {
        self.inner.lifecycle.throw_if_not_opened()?;
        let deadline = Deadline::after(timeout);

        loop {
            match self.inner.lifecycle.state() {
                CommunicationState::Opened => {}
                CommunicationState::Faulted => return Err(self.inner.lifecycle.terminal_error()),
                _ => return Ok(ReceiveOutcome::Closed),
            }

            let acquired = self
                .inner
                .synchronizer
                .try_get_channel_for_input(self.inner.config.can_open_for_receive, deadline)
                .await?;
            let channel = match acquired {
                ChannelAcquisition::Acquired(channel) => channel,
                ChannelAcquisition::TimedOut => return Ok(ReceiveOutcome::TimedOut),
                ChannelAcquisition::Unavailable => return Ok(ReceiveOutcome::Closed),
            };

            let lease = ChannelLease::new(&self.inner.synchronizer);
            let received = within(deadline, name, receive(channel, deadline.remaining())).await;
            let auto_aborted = self.inner.synchronizer.is_aborting();

            match received {
                Ok(ReceiveOutcome::Closed) if self.inner.tolerant => {
                    self.inner.synchronizer.on_read_eof();
                    lease.release().await;
                    debug!(object = BINDER, "Input ended, awaiting a fresh channel");
                }
                Ok(outcome) => {
                    lease.release().await;
                    return Ok(outcome);
                }
                Err(error) => {
                    lease.release().await;
                    if !self.handle_exception(&error, masking, auto_aborted) {
                        return Err(error);
                    }
                    if !self.inner.tolerant {
                        return Ok(ReceiveOutcome::TimedOut);
                    }
                }
            }

            if deadline.is_expired() {
                return Ok(ReceiveOutcome::TimedOut);
            }
        }
    }

    /// Bind an inbound request context to this binder's default masking
    pub fn wrap_request_context<R>(&self, context: R) -> BoundRequestContext<C, R>
    where
        R: RequestContext,
    {
        BoundRequestContext::new(context, self.clone(), self.inner.config.default_masking_mode)
    }
}

impl<C: OutputChannel> ChannelBinder<C> {
    /// Send `message` within `timeout`
    pub async fn send(
        &self,
        message: C::Message,
        timeout: Duration,
        masking: MaskingMode,
    ) -> ChannelResult<()> {
        self.run_output("send", timeout, masking, |channel, remaining| async move {
            channel.send(message, remaining).await
        })
        .await
        .map(|_| ())
    }

    /// Send with the configured timeout and masking
    pub async fn send_default(&self, message: C::Message) -> ChannelResult<()> {
        let config = &self.inner.config;
        self.send(message, config.send_timeout, config.default_masking_mode)
            .await
    }
}

impl<C: InputChannel> ChannelBinder<C> {
    /// Wait up to `timeout` for the next message
    ///
    /// A tolerant binder treats end of input as the end of the current
    /// channel and keeps waiting on a fresh one until the deadline.
    pub async fn try_receive(
        &self,
        timeout: Duration,
        masking: MaskingMode,
    ) -> ChannelResult<ReceiveOutcome<C::Message>> {
        self.run_input("receive", timeout, masking, |channel, remaining| async move {
            channel.try_receive(remaining).await
        })
        .await
    }

    /// Receive with the configured timeout and masking
    pub async fn try_receive_default(&self) -> ChannelResult<ReceiveOutcome<C::Message>> {
        let config = &self.inner.config;
        self.try_receive(config.receive_timeout, config.default_masking_mode)
            .await
    }
}

impl<C: RequestChannel> ChannelBinder<C> {
    /// Send `message` and wait for the reply; `None` if the failure was masked
    pub async fn request(
        &self,
        message: C::Message,
        timeout: Duration,
        masking: MaskingMode,
    ) -> ChannelResult<Option<C::Message>> {
        self.run_output("request", timeout, masking, |channel, remaining| async move {
            channel.request(message, remaining).await
        })
        .await
    }
}

impl<C: ReplyChannel> ChannelBinder<C> {
    /// Wait up to `timeout` for the next inbound request
    pub async fn try_receive_request(
        &self,
        timeout: Duration,
        masking: MaskingMode,
    ) -> ChannelResult<ReceiveOutcome<BoundRequestContext<C, C::Context>>> {
        let outcome = self
            .run_input("receive request", timeout, masking, |channel, remaining| async move {
                channel.try_receive_request(remaining).await
            })
            .await?;
        Ok(outcome.map(|context| self.wrap_request_context(context)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masking::FaultToleranceMode;
    use crate::synchronizer::SynchronizerState;
    use crate::testing::{MockChannel, MockChannelFactory};
    use assert_matches::assert_matches;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn binder(
        factory: &Arc<MockChannelFactory>,
        mode: FaultToleranceMode,
    ) -> ChannelBinder<MockChannel> {
        let config = BinderConfig::testing().with_fault_tolerance(mode);
        ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap()
    }

    async fn opened(
        factory: &Arc<MockChannelFactory>,
        mode: FaultToleranceMode,
    ) -> ChannelBinder<MockChannel> {
        let binder = binder(factory, mode);
        binder.open(TIMEOUT).await.unwrap();
        binder
    }

    fn drain(events: &mut broadcast::Receiver<BinderEvent>) -> Vec<BinderEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        seen
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = BinderConfig::testing();
        config.event_capacity = 0;
        let factory: Arc<dyn ChannelFactory<MockChannel>> = Arc::new(MockChannelFactory::new());
        assert_matches!(
            ChannelBinder::with_factory(factory, config),
            Err(ChannelError::InvalidArgument { .. })
        );
    }

    #[tokio::test]
    async fn test_open_connects_eagerly() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;

        assert_eq!(binder.state(), CommunicationState::Opened);
        assert_eq!(factory.calls(), 1);
        assert_eq!(binder.synchronizer().state(), SynchronizerState::ChannelOpened);
        assert_eq!(binder.synchronizer().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_open_failure_closes_binder() {
        let factory = Arc::new(MockChannelFactory::new());
        factory.fail_next_open(ChannelError::communication("refused"));
        let binder = binder(&factory, FaultToleranceMode::Never);

        assert_matches!(
            binder.open(TIMEOUT).await,
            Err(ChannelError::Communication { .. })
        );
        assert_eq!(binder.state(), CommunicationState::Closed);
    }

    #[tokio::test]
    async fn test_send_before_open_is_never_masked() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = binder(&factory, FaultToleranceMode::Always);

        let result = binder
            .send("early".into(), TIMEOUT, MaskingMode::ALL)
            .await;
        assert_matches!(result, Err(ChannelError::NotOpen { .. }));
        assert_eq!(factory.calls(), 0);
    }

    #[tokio::test]
    async fn test_send_reaches_channel() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;

        binder.send_default("hello".into()).await.unwrap();

        let channel = factory.last_channel().unwrap();
        assert_eq!(channel.sent_messages(), vec!["hello".to_string()]);
        assert_eq!(binder.synchronizer().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_handled_masking_absorbs_communication_failure() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        let channel = factory.last_channel().unwrap();

        channel.fail_next_send(ChannelError::communication("reset"));
        assert!(binder
            .send("a".into(), TIMEOUT, MaskingMode::HANDLED)
            .await
            .is_ok());

        channel.fail_next_send(ChannelError::communication("reset"));
        assert_matches!(
            binder.send("b".into(), TIMEOUT, MaskingMode::NONE).await,
            Err(ChannelError::Communication { .. })
        );
        assert_eq!(binder.synchronizer().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_protocol_errors_are_redirected_only_under_unhandled() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        let channel = factory.last_channel().unwrap();
        let mut events = binder.subscribe();

        channel.fail_next_send(ChannelError::protocol("bad frame"));
        assert_matches!(
            binder.send("a".into(), TIMEOUT, MaskingMode::HANDLED).await,
            Err(ChannelError::Protocol { .. })
        );
        assert!(drain(&mut events).is_empty());

        channel.fail_next_send(ChannelError::protocol("bad frame"));
        binder
            .send("b".into(), TIMEOUT, MaskingMode::UNHANDLED)
            .await
            .unwrap();
        assert_eq!(
            drain(&mut events),
            vec![BinderEvent::UnhandledError(ChannelError::protocol("bad frame"))]
        );
    }

    #[tokio::test]
    async fn test_close_on_faulted_binder_respects_masking() {
        let factory = Arc::new(MockChannelFactory::new());

        let strict = opened(&factory, FaultToleranceMode::Never).await;
        strict.fault(ChannelError::communication("lost"));
        assert_eq!(strict.state(), CommunicationState::Faulted);
        assert_matches!(
            strict.close(TIMEOUT).await,
            Err(ChannelError::Faulted { .. })
        );
        assert_eq!(strict.state(), CommunicationState::Closed);

        let lenient = opened(&factory, FaultToleranceMode::Never).await;
        lenient.fault(ChannelError::communication("lost"));
        lenient
            .close_with_masking(TIMEOUT, MaskingMode::HANDLED)
            .await
            .unwrap();
        assert_eq!(lenient.state(), CommunicationState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_default_uses_configured_timeout() {
        let factory = Arc::new(MockChannelFactory::new());
        factory.set_open_delay(Duration::from_secs(1));
        let config = BinderConfig {
            open_timeout: Duration::from_millis(100),
            ..BinderConfig::testing()
        };
        let binder = ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap();

        let started = tokio::time::Instant::now();
        assert_matches!(
            binder.open_default().await,
            Err(ChannelError::Timeout { .. })
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(binder.state(), CommunicationState::Closed);
    }

    #[tokio::test]
    async fn test_close_default_applies_configured_masking() {
        let factory = Arc::new(MockChannelFactory::new());

        let strict = opened(&factory, FaultToleranceMode::Never).await;
        strict.fault(ChannelError::communication("lost"));
        assert_matches!(
            strict.close_default().await,
            Err(ChannelError::Faulted { .. })
        );

        let config = BinderConfig::testing().with_masking(MaskingMode::HANDLED);
        let lenient = ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap();
        lenient.open_default().await.unwrap();
        lenient.fault(ChannelError::communication("lost"));
        lenient.close_default().await.unwrap();
        assert_eq!(lenient.state(), CommunicationState::Closed);
    }

    #[tokio::test]
    async fn test_untolerated_channel_fault_faults_binder() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        let mut events = binder.subscribe();

        factory.last_channel().unwrap().fault();

        assert_eq!(binder.state(), CommunicationState::Faulted);
        assert_eq!(drain(&mut events), vec![BinderEvent::Faulted]);
        assert_matches!(
            binder.send("a".into(), TIMEOUT, MaskingMode::ALL).await,
            Err(ChannelError::Faulted { .. })
        );
        assert_matches!(
            binder.try_receive(TIMEOUT, MaskingMode::ALL).await,
            Err(ChannelError::Faulted { .. })
        );
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn test_tolerated_channel_fault_reconnects() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Always).await;
        let mut events = binder.subscribe();
        let first = factory.last_channel().unwrap();

        first.fault();
        assert_eq!(drain(&mut events), vec![BinderEvent::ConnectionLost]);
        assert_eq!(binder.state(), CommunicationState::Opened);
        assert_eq!(binder.synchronizer().state(), SynchronizerState::NoChannel);

        binder
            .send("again".into(), TIMEOUT, MaskingMode::NONE)
            .await
            .unwrap();
        let second = factory.last_channel().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.sent_messages(), vec!["again".to_string()]);
    }

    #[test]
    fn test_security_sessions_disable_conditional_tolerance() {
        let factory: Arc<dyn ChannelFactory<MockChannel>> =
            Arc::new(MockChannelFactory::with_security_sessions());
        let config = BinderConfig::testing()
            .with_fault_tolerance(FaultToleranceMode::IfNotSecuritySession);
        let binder = ChannelBinder::<MockChannel>::with_factory(factory, config).unwrap();
        assert!(!binder.tolerates_faults());
    }

    #[tokio::test]
    async fn test_receive_returns_queued_message() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        factory.last_channel().unwrap().push_message("inbound");

        let outcome = binder.try_receive_default().await.unwrap();
        assert_eq!(outcome, ReceiveOutcome::Message("inbound".to_string()));
    }

    #[tokio::test]
    async fn test_receive_failure_respects_masking() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        let channel = factory.last_channel().unwrap();

        channel.fail_next_receive(ChannelError::communication("reset"));
        let outcome = binder.try_receive(TIMEOUT, MaskingMode::HANDLED).await;
        assert_eq!(outcome, Ok(ReceiveOutcome::TimedOut));

        channel.fail_next_receive(ChannelError::communication("reset"));
        assert_matches!(
            binder.try_receive(TIMEOUT, MaskingMode::NONE).await,
            Err(ChannelError::Communication { .. })
        );
        assert_eq!(binder.synchronizer().in_flight(), 0);
        assert_eq!(binder.state(), CommunicationState::Opened);
    }

    #[tokio::test]
    async fn test_untolerated_end_of_input_reports_closed() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        factory.last_channel().unwrap().close_input();

        let outcome = binder.try_receive(TIMEOUT, MaskingMode::NONE).await.unwrap();
        assert_eq!(outcome, ReceiveOutcome::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tolerated_end_of_input_moves_to_fresh_channel() {
        let factory = Arc::new(MockChannelFactory::new());
        let config = BinderConfig::client();
        let binder = ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap();
        binder.open(TIMEOUT).await.unwrap();
        let first = factory.last_channel().unwrap();
        first.close_input();

        let outcome = binder
            .try_receive(Duration::from_millis(100), MaskingMode::ALL)
            .await
            .unwrap();

        assert_eq!(outcome, ReceiveOutcome::TimedOut);
        assert_eq!(first.close_count(), 1);
        assert_eq!(factory.calls(), 2);
    }

    #[tokio::test]
    async fn test_request_masks_failures_as_absent_reply() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;
        let channel = factory.last_channel().unwrap();

        let reply = binder
            .request("ping".into(), TIMEOUT, MaskingMode::NONE)
            .await
            .unwrap();
        assert_eq!(reply.as_deref(), Some("ping"));

        channel.fail_next_send(ChannelError::communication("reset"));
        let reply = binder
            .request("ping".into(), TIMEOUT, MaskingMode::HANDLED)
            .await
            .unwrap();
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_received_request_replies_through_binder() {
        let factory = Arc::new(MockChannelFactory::new());
        let config = BinderConfig::testing().with_masking(MaskingMode::HANDLED);
        let binder = ChannelBinder::<MockChannel>::with_factory(factory.clone(), config).unwrap();
        binder.open(TIMEOUT).await.unwrap();
        factory.last_channel().unwrap().push_message("question");

        let context = binder
            .try_receive_request(TIMEOUT, MaskingMode::NONE)
            .await
            .unwrap()
            .into_message()
            .unwrap();
        assert!(context.is_masked());
        assert_eq!(context.request_message(), "question");

        context.reply("answer".into(), TIMEOUT).await.unwrap();
        assert_eq!(context.inner().replies(), vec!["answer".to_string()]);
    }

    #[tokio::test]
    async fn test_dropped_receive_returns_channel() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;

        let receiving = {
            let binder = binder.clone();
            tokio::spawn(async move { binder.try_receive(TIMEOUT, MaskingMode::NONE).await })
        };
        for _ in 0..10 {
            if binder.synchronizer().in_flight() == 1 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(binder.synchronizer().in_flight(), 1);

        receiving.abort();
        assert!(receiving.await.unwrap_err().is_cancelled());
        assert_eq!(binder.synchronizer().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_close_drains_and_closes_channel() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;

        binder.close(TIMEOUT).await.unwrap();
        assert_eq!(binder.state(), CommunicationState::Closed);
        assert_eq!(binder.synchronizer().state(), SynchronizerState::Closed);
        assert_eq!(factory.last_channel().unwrap().close_count(), 1);

        assert_matches!(
            binder.send("late".into(), TIMEOUT, MaskingMode::ALL).await,
            Err(ChannelError::Closed { .. })
        );
    }

    #[tokio::test]
    async fn test_abort_reports_aborted() {
        let factory = Arc::new(MockChannelFactory::new());
        let binder = opened(&factory, FaultToleranceMode::Never).await;

        binder.abort();
        assert_eq!(factory.last_channel().unwrap().abort_count(), 1);
        assert_matches!(
            binder.send("late".into(), TIMEOUT, MaskingMode::NONE).await,
            Err(ChannelError::Aborted { .. })
        );
    }

    #[tokio::test]
    async fn test_accepting_binder_serves_handed_in_channel() {
        let config = BinderConfig::server();
        let binder: ChannelBinder<MockChannel> = ChannelBinder::accepting(config).unwrap();
        binder.open(TIMEOUT).await.unwrap();

        let channel = Arc::new(MockChannel::new("accepted"));
        channel.open(TIMEOUT).await.unwrap();
        channel.push_message("hello");
        assert!(binder.set_channel(channel.clone()).unwrap());

        let outcome = binder.try_receive(TIMEOUT, MaskingMode::ALL).await.unwrap();
        assert_eq!(outcome, ReceiveOutcome::Message("hello".to_string()));
    }
}

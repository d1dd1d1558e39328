//! Channel Synchronizer
//!
//! Shares at most one physical channel between every concurrent operation of
//! a binder. Operations acquire the channel, use it, and return it; the
//! synchronizer opens a replacement on demand and retires a faulted channel
//! once the last holder has returned it.
//!
//! ```text
//! Created -> NoChannel <-> ChannelOpening -> ChannelOpened -> ChannelClosing
//!                ^                                                |
//!                `------------------------------------------------'
//! any non-terminal state -> Closed | Faulted
//! ```
//!
//! At most one open is in flight. Callers arriving while the channel is
//! opening or being retired are queued in FIFO order; when the open succeeds
//! every queued caller is granted the channel in one batch.
//!
//! ## Lock Usage
//!
//! Uses `parking_lot::Mutex` for the synchronizer state because:
//! - Every decision is computed under the lock and committed before release
//! - Channel I/O, waiter signals and owner callbacks run after release
//! - The lock is never held across `.await` points

mod waiter;

use self::waiter::{Waiter, WaiterId, WaiterQueues, WaiterSignal};
use crate::channel::{Channel, ChannelFactory, FaultListener, ListenerId};
use crate::deadline::{within, Deadline};
use crate::error::{ChannelError, ChannelResult};
use crate::lifecycle::CommunicationState;
use crate::masking::MaskingMode;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Phase of the shared channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SynchronizerState {
    /// Not yet started
    Created,
    /// No channel; the next open-capable caller opens one
    NoChannel,
    /// One caller is opening a channel
    ChannelOpening,
    /// A channel is available
    ChannelOpened,
    /// The channel is being retired once its holders return it
    ChannelClosing,
    /// Stopped by a fault or abort of the owner
    Faulted,
    /// Stopped by a graceful close of the owner
    Closed,
}

/// Outcome of a channel acquisition
#[derive(Debug)]
pub enum ChannelAcquisition<C> {
    /// The caller holds the channel and must return it
    Acquired(Arc<C>),
    /// No channel will be provided (masked failure or shutdown)
    Unavailable,
    /// The deadline passed before a channel became available
    TimedOut,
}

impl<C> ChannelAcquisition<C> {
    /// The acquired channel, if any
    pub fn into_channel(self) -> Option<Arc<C>> {
        match self {
            Self::Acquired(channel) => Some(channel),
            _ => None,
        }
    }

    /// Whether a channel was acquired
    pub fn is_acquired(&self) -> bool {
        matches!(self, Self::Acquired(_))
    }
}

/// Callbacks from the synchronizer into the object that owns it
pub trait SynchronizerOwner: Send + Sync {
    /// Fault the owner
    fn fault(&self, error: ChannelError);

    /// A tolerated inner fault retired the channel
    fn connection_lost(&self);

    /// Error reported to callers once the owner is closed, aborted or faulted
    fn terminal_error(&self) -> ChannelError;
}

struct Retirement<C> {
    channel: Option<Arc<C>>,
    listener: Option<ListenerId>,
    abort: bool,
    connection_lost: bool,
}

enum Installation<C> {
    Rejected,
    Pending(Option<Waiter<C>>, Vec<Waiter<C>>),
    Opened(Vec<Waiter<C>>),
}

enum Reaction<C> {
    Nothing,
    Abort(Arc<C>),
    Retire(Retirement<C>),
    FaultOwner(ChannelError),
}

struct SyncInner<C: Channel> {
    state: SynchronizerState,
    channel: Option<Arc<C>>,
    fault_listener: Option<ListenerId>,
    count: usize,
    waiters: WaiterQueues<C>,
    drain_waiters: Vec<oneshot::Sender<()>>,
    aborting: bool,
    inner_faulted: bool,
    established: bool,
}

impl<C: Channel> SyncInner<C> {
    fn holds(&self, channel: &Arc<C>) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, channel))
    }

    fn has_unopened_channel(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.state() == CommunicationState::Created)
    }

    fn retirement(&mut self) -> Retirement<C> {
        Retirement {
            channel: self.channel.take(),
            listener: self.fault_listener.take(),
            abort: self.aborting,
            connection_lost: std::mem::take(&mut self.inner_faulted),
        }
    }

    /// Promote the oldest live open-capable waiter, or settle in `NoChannel`
    fn next_opener(&mut self) -> (Option<Waiter<C>>, Vec<Waiter<C>>) {
        let (next, expired) = self.waiters.pop_opener();
        self.state = if next.is_some() {
            SynchronizerState::ChannelOpening
        } else {
            SynchronizerState::NoChannel
        };
        (next, expired)
    }
}

struct Shared<C: Channel> {
    object: String,
    owner: Weak<dyn SynchronizerOwner>,
    factory: Option<Arc<dyn ChannelFactory<C>>>,
    tolerate_faults: bool,
    close_timeout: Duration,
    inner: Mutex<SyncInner<C>>,
}

impl<C: Channel> Shared<C> {
    fn terminal_error(&self) -> ChannelError {
        match self.owner.upgrade() {
            Some(owner) => owner.terminal_error(),
            None => ChannelError::closed(&self.object),
        }
    }

    fn fault_owner(&self, error: ChannelError) {
        match self.owner.upgrade() {
            Some(owner) => owner.fault(error),
            None => warn!(object = %self.object, error = %error, "Owner gone, fault dropped"),
        }
    }

    fn connection_lost(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.connection_lost();
        }
    }

    fn resolve_terminal(&self, masking: MaskingMode) -> ChannelResult<ChannelAcquisition<C>> {
        if masking.contains(MaskingMode::HANDLED) {
            Ok(ChannelAcquisition::Unavailable)
        } else {
            Err(self.terminal_error())
        }
    }

    /// Signal a promoted opener, moving on to the next one if it left
    fn dispatch_opener(&self, next: Option<Waiter<C>>, expired: Vec<Waiter<C>>) {
        for waiter in expired {
            waiter.time_out();
        }
        if let Some(waiter) = next {
            if !waiter.promote() {
                self.hand_off_open();
            }
        }
    }

    /// Pass the open duty on from a caller that will not open
    fn hand_off_open(&self) {
        let (next, expired) = {
            let mut inner = self.inner.lock();
            if inner.state != SynchronizerState::ChannelOpening {
                return;
            }
            inner.next_opener()
        };
        self.dispatch_opener(next, expired);
    }

    /// Drop one hold on the channel, returning the retirement it triggers
    fn release_one(&self) -> Option<Retirement<C>> {
        let (retirement, drained) = {
            let mut inner = self.inner.lock();
            if inner.count == 0 {
                drop(inner);
                error!(object = %self.object, "Channel returned more often than acquired");
                return None;
            }
            inner.count -= 1;
            if inner.count > 0 {
                return None;
            }
            let drained = std::mem::take(&mut inner.drain_waiters);
            let retirement = (inner.state == SynchronizerState::ChannelClosing)
                .then(|| inner.retirement());
            (retirement, drained)
        };

        for waiter in drained {
            let _ = waiter.send(());
        }
        retirement
    }

    /// Abort the retiring channel and leave `ChannelClosing`
    fn retire_now(&self, retirement: Retirement<C>) {
        if let Some(channel) = retirement.channel {
            if let Some(id) = retirement.listener {
                channel.unsubscribe_faulted(id);
            }
            channel.abort();
        }
        self.finish_retirement(retirement.connection_lost);
    }

    fn finish_retirement(&self, connection_lost: bool) {
        let (next, expired) = {
            let mut inner = self.inner.lock();
            if inner.state != SynchronizerState::ChannelClosing {
                return;
            }
            inner.aborting = false;
            inner.next_opener()
        };
        info!(object = %self.object, connection_lost, "Channel retired");

        if connection_lost {
            self.connection_lost();
        }
        self.dispatch_opener(next, expired);
    }
}

/// Hands the open duty on if the opening caller is dropped mid-open
///
/// A channel the factory already produced is aborted, never installed.
struct PendingOpen<'a, C: Channel> {
    shared: &'a Shared<C>,
    channel: Option<Arc<C>>,
    armed: bool,
}

impl<C: Channel> Drop for PendingOpen<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(channel) = self.channel.take() {
            debug!(object = %self.shared.object, "Opener dropped, aborting its channel");
            channel.abort();
        }
        self.shared.hand_off_open();
    }
}

/// Removes a queued caller that stops waiting
///
/// A caller that was already dispatched settles the signal it will never
/// read: a granted hold is returned and an open duty is passed on.
struct QueuedWaiter<'a, C: Channel> {
    synchronizer: &'a ChannelSynchronizer<C>,
    id: WaiterId,
    receiver: oneshot::Receiver<WaiterSignal<C>>,
    armed: bool,
}

impl<C: Channel> Drop for QueuedWaiter<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removed = self.synchronizer.shared.inner.lock().waiters.remove(self.id);
        if removed {
            return;
        }

        // Closing first makes any later send fail back to the dispatcher
        self.receiver.close();
        match self.receiver.try_recv() {
            Ok(WaiterSignal::Granted(_)) => self.synchronizer.release_detached(),
            Ok(WaiterSignal::BecomeOpener) => self.synchronizer.shared.hand_off_open(),
            _ => {}
        }
    }
}

/// Completes a retirement even if the graceful close is abandoned
struct PendingRetirement<'a, C: Channel> {
    shared: &'a Shared<C>,
    retirement: Option<Retirement<C>>,
}

impl<C: Channel> Drop for PendingRetirement<'_, C> {
    fn drop(&mut self) {
        if let Some(retirement) = self.retirement.take() {
            self.shared.retire_now(retirement);
        }
    }
}

/// Shares one physical channel between concurrent operations
pub struct ChannelSynchronizer<C: Channel> {
    shared: Arc<Shared<C>>,
}

impl<C: Channel> Clone for ChannelSynchronizer<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Channel> fmt::Debug for ChannelSynchronizer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.shared.inner.lock();
        f.debug_struct("ChannelSynchronizer")
            .field("object", &self.shared.object)
            .field("state", &inner.state)
            .field("in_flight", &inner.count)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

impl<C: Channel> ChannelSynchronizer<C> {
    /// Create a synchronizer for `owner`
    ///
    /// `factory` is used to open replacement channels; `channel` is an
    /// initial channel, opened or not. With neither, channels must be handed
    /// in through [`ChannelSynchronizer::set_channel`].
    pub fn new(
        object: impl Into<String>,
        owner: Weak<dyn SynchronizerOwner>,
        factory: Option<Arc<dyn ChannelFactory<C>>>,
        channel: Option<Arc<C>>,
        tolerate_faults: bool,
        close_timeout: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                object: object.into(),
                owner,
                factory,
                tolerate_faults,
                close_timeout,
                inner: Mutex::new(SyncInner {
                    state: SynchronizerState::Created,
                    channel,
                    fault_listener: None,
                    count: 0,
                    waiters: WaiterQueues::new(),
                    drain_waiters: Vec::new(),
                    aborting: false,
                    inner_faulted: false,
                    established: false,
                }),
            }),
        }
    }

    /// Current state
    pub fn state(&self) -> SynchronizerState {
        self.shared.inner.lock().state
    }

    /// Number of outstanding acquisitions
    pub fn in_flight(&self) -> usize {
        self.shared.inner.lock().count
    }

    /// Number of suspended callers
    pub fn queued_waiters(&self) -> usize {
        self.shared.inner.lock().waiters.len()
    }

    /// The channel currently installed, if any
    pub fn current_channel(&self) -> Option<Arc<C>> {
        self.shared.inner.lock().channel.clone()
    }

    /// Whether the current channel is being retired after a fault or abort
    pub fn is_aborting(&self) -> bool {
        self.shared.inner.lock().aborting
    }

    /// Whether inner channel faults are recoverable
    pub fn tolerates_faults(&self) -> bool {
        self.shared.tolerate_faults
    }

    fn listener_for(&self, channel: &Arc<C>) -> FaultListener {
        let shared = Arc::downgrade(&self.shared);
        let channel = Arc::downgrade(channel);
        Arc::new(move || {
            if let (Some(shared), Some(channel)) = (shared.upgrade(), channel.upgrade()) {
                ChannelSynchronizer { shared }.on_channel_faulted(&channel);
            }
        })
    }

    /// Begin serving acquisitions
    ///
    /// An already opened initial channel is installed directly.
    pub fn start_synchronizing(&self) -> ChannelResult<()> {
        let initial = {
            let inner = self.shared.inner.lock();
            if inner.state != SynchronizerState::Created {
                return Err(ChannelError::invalid_state(format!(
                    "{} is already synchronizing",
                    self.shared.object
                )));
            }
            inner.channel.clone()
        };

        let opened = initial.filter(|channel| channel.state() == CommunicationState::Opened);
        let Some(channel) = opened else {
            let mut inner = self.shared.inner.lock();
            if inner.state == SynchronizerState::Created {
                inner.state = SynchronizerState::NoChannel;
            }
            return Ok(());
        };

        let listener = channel.subscribe_faulted(self.listener_for(&channel));
        {
            let mut inner = self.shared.inner.lock();
            if inner.state != SynchronizerState::Created {
                drop(inner);
                channel.unsubscribe_faulted(listener);
                return Ok(());
            }
            inner.state = SynchronizerState::ChannelOpened;
            inner.fault_listener = Some(listener);
            inner.established = true;
        }
        debug!(object = %self.shared.object, "Synchronizing with initial channel");

        if channel.state() == CommunicationState::Faulted {
            self.on_channel_faulted(&channel);
        }
        Ok(())
    }

    /// Acquire the channel for sending, opening one if needed
    pub async fn try_get_channel_for_output(
        &self,
        deadline: Deadline,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        self.try_get_channel(true, deadline, masking).await
    }

    /// Acquire the channel for receiving
    ///
    /// Faults are always masked; a receive loop only learns that no channel
    /// is available.
    pub async fn try_get_channel_for_input(
        &self,
        can_initiate_open: bool,
        deadline: Deadline,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        self.try_get_channel(can_initiate_open, deadline, MaskingMode::ALL)
            .await
    }

    async fn try_get_channel(
        &self,
        can_initiate_open: bool,
        deadline: Deadline,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        let queued = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                SynchronizerState::Created => {
                    return Err(ChannelError::invalid_state(format!(
                        "{} has not started synchronizing",
                        self.shared.object
                    )));
                }
                SynchronizerState::Closed | SynchronizerState::Faulted => {
                    drop(inner);
                    return self.shared.resolve_terminal(masking);
                }
                SynchronizerState::ChannelOpened => {
                    let Some(channel) = inner.channel.clone() else {
                        return Err(ChannelError::invalid_state(format!(
                            "{} lost track of its opened channel",
                            self.shared.object
                        )));
                    };
                    inner.count += 1;
                    return Ok(ChannelAcquisition::Acquired(channel));
                }
                SynchronizerState::NoChannel | SynchronizerState::ChannelClosing
                    if !self.shared.tolerate_faults && inner.established =>
                {
                    drop(inner);
                    self.shared.fault_owner(ChannelError::communication(format!(
                        "{} lost its channel",
                        self.shared.object
                    )));
                    return Ok(ChannelAcquisition::Unavailable);
                }
                _ => {}
            }

            if deadline.is_expired() {
                return Ok(ChannelAcquisition::TimedOut);
            }

            let can_open = can_initiate_open
                && (self.shared.factory.is_some() || inner.has_unopened_channel());
            if inner.state == SynchronizerState::NoChannel && can_open {
                inner.state = SynchronizerState::ChannelOpening;
                None
            } else {
                Some(inner.waiters.enqueue(can_open, deadline, masking))
            }
        };

        match queued {
            None => self.open_channel(deadline, masking).await,
            Some((id, receiver)) => self.wait(id, receiver, deadline, masking).await,
        }
    }

    async fn wait(
        &self,
        id: WaiterId,
        receiver: oneshot::Receiver<WaiterSignal<C>>,
        deadline: Deadline,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        let mut queued = QueuedWaiter {
            synchronizer: self,
            id,
            receiver,
            armed: true,
        };

        let signal = match deadline.instant() {
            Some(at) => match tokio::time::timeout_at(at, &mut queued.receiver).await {
                Ok(signal) => signal,
                Err(_) => {
                    if self.shared.inner.lock().waiters.remove(id) {
                        queued.armed = false;
                        return Ok(ChannelAcquisition::TimedOut);
                    }
                    // Already dispatched; the signal is on its way
                    (&mut queued.receiver).await
                }
            },
            None => (&mut queued.receiver).await,
        };
        queued.armed = false;

        match signal {
            Ok(WaiterSignal::Granted(channel)) => Ok(ChannelAcquisition::Acquired(channel)),
            Ok(WaiterSignal::BecomeOpener) => {
                if deadline.is_expired() {
                    self.shared.hand_off_open();
                    return Ok(ChannelAcquisition::TimedOut);
                }
                self.open_channel(deadline, masking).await
            }
            Ok(WaiterSignal::TimedOut) => Ok(ChannelAcquisition::TimedOut),
            Ok(WaiterSignal::Unavailable) | Err(_) => Ok(ChannelAcquisition::Unavailable),
            Ok(WaiterSignal::Failed(error)) => Err(error),
        }
    }

    async fn open_channel(
        &self,
        deadline: Deadline,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        let mut opening = PendingOpen {
            shared: &self.shared,
            channel: None,
            armed: true,
        };
        let established = self.establish(deadline, &mut opening).await;
        opening.armed = false;

        match established {
            Ok(Some(channel)) => self.commit_opened(channel, masking),
            Ok(None) => self.open_failed(
                ChannelError::communication(format!(
                    "{} could not obtain a channel",
                    self.shared.object
                )),
                masking,
            ),
            Err(error) => self.open_failed(error, masking),
        }
    }

    /// Obtain and open a channel outside the lock
    async fn establish(
        &self,
        deadline: Deadline,
        opening: &mut PendingOpen<'_, C>,
    ) -> ChannelResult<Option<Arc<C>>> {
        let pending = self
            .shared
            .inner
            .lock()
            .channel
            .clone()
            .filter(|channel| channel.state() == CommunicationState::Created);

        let channel = match (pending, &self.shared.factory) {
            (Some(channel), _) => channel,
            (None, Some(factory)) => {
                let acquired = within(
                    deadline,
                    "acquire channel",
                    factory.try_get_channel(deadline.remaining()),
                )
                .await?;
                let Some(channel) = acquired else {
                    return Ok(None);
                };
                opening.channel = Some(channel.clone());
                channel
            }
            (None, None) => return Ok(None),
        };

        if channel.state() == CommunicationState::Created {
            debug!(object = %self.shared.object, "Opening channel");
            let opened = within(
                deadline,
                "open channel",
                channel.open(deadline.remaining()),
            )
            .await;
            if let Err(error) = opened {
                channel.abort();
                return Err(error);
            }
        }
        Ok(Some(channel))
    }

    fn commit_opened(
        &self,
        channel: Arc<C>,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        let listener = channel.subscribe_faulted(self.listener_for(&channel));
        let granted = {
            let mut inner = self.shared.inner.lock();
            if inner.state == SynchronizerState::ChannelOpening {
                inner.state = SynchronizerState::ChannelOpened;
                inner.channel = Some(channel.clone());
                inner.fault_listener = Some(listener);
                inner.established = true;
                inner.aborting = false;
                let waiters = inner.waiters.drain_all();
                inner.count += 1 + waiters.len();
                Some(waiters)
            } else {
                None
            }
        };

        let Some(waiters) = granted else {
            debug!(object = %self.shared.object, "Stopped while opening, discarding channel");
            channel.unsubscribe_faulted(listener);
            channel.abort();
            return self.shared.resolve_terminal(masking);
        };

        info!(object = %self.shared.object, waiters = waiters.len(), "Channel opened");
        self.grant_all(&channel, waiters);

        if channel.state() == CommunicationState::Faulted {
            self.on_channel_faulted(&channel);
        }
        Ok(ChannelAcquisition::Acquired(channel))
    }

    fn grant_all(&self, channel: &Arc<C>, waiters: Vec<Waiter<C>>) {
        for waiter in waiters {
            if !waiter.grant(channel.clone()) {
                self.release_detached();
            }
        }
    }

    fn open_failed(
        &self,
        error: ChannelError,
        masking: MaskingMode,
    ) -> ChannelResult<ChannelAcquisition<C>> {
        if self.shared.tolerate_faults && error.is_handleable() {
            warn!(object = %self.shared.object, error = %error, "Channel open failed");
            let promoted = {
                let mut inner = self.shared.inner.lock();
                (inner.state == SynchronizerState::ChannelOpening).then(|| inner.next_opener())
            };
            if let Some((next, expired)) = promoted {
                self.shared.dispatch_opener(next, expired);
            }
        } else {
            let waiters = {
                let mut inner = self.shared.inner.lock();
                if inner.state == SynchronizerState::ChannelOpening {
                    inner.state = SynchronizerState::Faulted;
                    Some(inner.waiters.drain_all())
                } else {
                    None
                }
            };
            if let Some(waiters) = waiters {
                error!(object = %self.shared.object, error = %error, "Channel open failed, faulting");
                for waiter in waiters {
                    waiter.fault(error.clone());
                }
                self.shared.fault_owner(error.clone());
            }
        }

        if masking.absorbs(&error) {
            Ok(ChannelAcquisition::Unavailable)
        } else {
            Err(error)
        }
    }

    /// Give back a channel obtained from a successful acquisition
    ///
    /// The last return of a retiring channel closes or aborts it and leaves
    /// the synchronizer ready to open a replacement.
    pub async fn return_channel(&self) {
        if let Some(retirement) = self.shared.release_one() {
            self.retire(retirement).await;
        }
    }

    /// Like [`ChannelSynchronizer::return_channel`], without awaiting teardown
    pub(crate) fn release_detached(&self) {
        let Some(retirement) = self.shared.release_one() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let synchronizer = self.clone();
                handle.spawn(async move { synchronizer.retire(retirement).await });
            }
            Err(_) => self.shared.retire_now(retirement),
        }
    }

    async fn retire(&self, mut retirement: Retirement<C>) {
        if let (Some(channel), Some(id)) = (&retirement.channel, retirement.listener.take()) {
            channel.unsubscribe_faulted(id);
        }
        let graceful = retirement
            .channel
            .clone()
            .filter(|channel| !retirement.abort && channel.state() == CommunicationState::Opened);

        // Dropping the guard aborts whatever the close left and leaves ChannelClosing
        let _pending = PendingRetirement {
            shared: &self.shared,
            retirement: Some(retirement),
        };

        if let Some(channel) = graceful {
            let timeout = self.shared.close_timeout;
            let closed = within(
                Deadline::after(timeout),
                "close channel",
                channel.close(timeout),
            )
            .await;
            if let Err(error) = closed {
                warn!(object = %self.shared.object, error = %error, "Channel close failed, aborting");
            }
        }
    }

    /// React to a fault of `channel`
    ///
    /// Faults of channels that are no longer current are ignored. A tolerant
    /// synchronizer retires the channel once it is no longer held; otherwise
    /// the owner is faulted.
    pub fn on_channel_faulted(&self, channel: &Arc<C>) {
        let reaction = {
            let mut inner = self.shared.inner.lock();
            let active = matches!(
                inner.state,
                SynchronizerState::ChannelOpened | SynchronizerState::ChannelClosing
            );
            if !active || !inner.holds(channel) {
                Reaction::Nothing
            } else if !self.shared.tolerate_faults {
                Reaction::FaultOwner(ChannelError::communication(format!(
                    "Inner channel of {} faulted",
                    self.shared.object
                )))
            } else {
                inner.inner_faulted = true;
                inner.aborting = true;
                inner.state = SynchronizerState::ChannelClosing;
                if inner.count == 0 {
                    Reaction::Retire(inner.retirement())
                } else {
                    Reaction::Abort(channel.clone())
                }
            }
        };

        if !matches!(reaction, Reaction::Nothing) {
            warn!(object = %self.shared.object, "Inner channel faulted");
        }
        self.react(reaction);
    }

    fn react(&self, reaction: Reaction<C>) {
        match reaction {
            Reaction::Nothing => {}
            Reaction::Abort(channel) => channel.abort(),
            Reaction::Retire(retirement) => self.shared.retire_now(retirement),
            Reaction::FaultOwner(error) => self.shared.fault_owner(error),
        }
    }

    /// The current channel reported end of input
    ///
    /// A tolerant synchronizer retires it gracefully once it is returned.
    pub fn on_read_eof(&self) {
        if !self.shared.tolerate_faults {
            return;
        }
        let mut inner = self.shared.inner.lock();
        if inner.state == SynchronizerState::ChannelOpened && inner.count > 0 {
            inner.state = SynchronizerState::ChannelClosing;
            debug!(object = %self.shared.object, "Channel reached end of input");
        }
    }

    /// Retire the current channel immediately
    ///
    /// Only valid for a fault-tolerant synchronizer; a replacement is opened
    /// on the next demand.
    pub fn abort_current_channel(&self) -> ChannelResult<()> {
        if !self.shared.tolerate_faults {
            return Err(ChannelError::invalid_state(format!(
                "{} does not tolerate channel faults",
                self.shared.object
            )));
        }

        let reaction = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                SynchronizerState::ChannelOpened if inner.count == 0 => {
                    inner.aborting = true;
                    inner.state = SynchronizerState::ChannelClosing;
                    Reaction::Retire(inner.retirement())
                }
                SynchronizerState::ChannelOpened | SynchronizerState::ChannelClosing => {
                    inner.aborting = true;
                    inner.state = SynchronizerState::ChannelClosing;
                    inner.channel.clone().map_or(Reaction::Nothing, Reaction::Abort)
                }
                _ => Reaction::Nothing,
            }
        };
        self.react(reaction);
        Ok(())
    }

    /// Hand in a channel accepted from outside
    ///
    /// Accepted only while no channel is installed. An opened channel is
    /// granted to every queued caller; an unopened one is opened by the next
    /// open-capable caller. Returns false if the channel was rejected.
    pub fn set_channel(&self, channel: Arc<C>) -> bool {
        let opened = channel.state() == CommunicationState::Opened;
        let listener = opened.then(|| channel.subscribe_faulted(self.listener_for(&channel)));
        let installed = {
            let mut inner = self.shared.inner.lock();
            let state = inner.state;
            match state {
                SynchronizerState::Created if inner.channel.is_none() => {
                    inner.channel = Some(channel.clone());
                    Installation::Pending(None, Vec::new())
                }
                SynchronizerState::NoChannel if opened => {
                    inner.state = SynchronizerState::ChannelOpened;
                    inner.channel = Some(channel.clone());
                    inner.fault_listener = listener;
                    inner.established = true;
                    let waiters = inner.waiters.drain_all();
                    inner.count += waiters.len();
                    Installation::Opened(waiters)
                }
                SynchronizerState::NoChannel => {
                    inner.channel = Some(channel.clone());
                    let (next, expired) = inner.next_opener();
                    Installation::Pending(next, expired)
                }
                _ => Installation::Rejected,
            }
        };

        match installed {
            Installation::Rejected => {
                if let Some(id) = listener {
                    channel.unsubscribe_faulted(id);
                }
                debug!(object = %self.shared.object, "Channel rejected");
                false
            }
            Installation::Pending(next, expired) => {
                // Start or the next opener subscribes once the channel is open
                if let Some(id) = listener {
                    channel.unsubscribe_faulted(id);
                }
                self.shared.dispatch_opener(next, expired);
                true
            }
            Installation::Opened(waiters) => {
                info!(object = %self.shared.object, waiters = waiters.len(), "Channel installed");
                self.grant_all(&channel, waiters);
                if channel.state() == CommunicationState::Faulted {
                    self.on_channel_faulted(&channel);
                }
                true
            }
        }
    }

    /// Wait until no operation holds the channel
    pub async fn wait_for_pending_operations(&self, deadline: Deadline) -> ChannelResult<()> {
        let drained = {
            let mut inner = self.shared.inner.lock();
            if inner.count == 0 {
                return Ok(());
            }
            let (sender, receiver) = oneshot::channel();
            inner.drain_waiters.push(sender);
            receiver
        };

        within(deadline, "wait for pending operations", async {
            let _ = drained.await;
            Ok(())
        })
        .await
    }

    /// Stop serving acquisitions and release every queued caller
    ///
    /// `close` distinguishes a graceful close from a fault or abort of the
    /// owner. Returns the installed channel for the owner to close or abort.
    pub fn stop_synchronizing(&self, close: bool) -> Option<Arc<C>> {
        let (channel, listener, waiters, drained) = {
            let mut inner = self.shared.inner.lock();
            if matches!(
                inner.state,
                SynchronizerState::Closed | SynchronizerState::Faulted
            ) {
                return None;
            }
            inner.state = if close {
                SynchronizerState::Closed
            } else {
                SynchronizerState::Faulted
            };
            (
                inner.channel.take(),
                inner.fault_listener.take(),
                inner.waiters.drain_all(),
                std::mem::take(&mut inner.drain_waiters),
            )
        };
        debug!(object = %self.shared.object, close, waiters = waiters.len(), "Stopped synchronizing");

        if close {
            for waiter in waiters {
                waiter.close();
            }
        } else {
            let error = self.shared.terminal_error();
            for waiter in waiters {
                waiter.fault(error.clone());
            }
        }
        for waiter in drained {
            let _ = waiter.send(());
        }

        if let (Some(channel), Some(id)) = (&channel, listener) {
            channel.unsubscribe_faulted(id);
        }
        channel
    }
}

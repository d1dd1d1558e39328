//! Communication Object Lifecycle
//!
//! Every channel, factory and binder in this crate moves through the same
//! state machine:
//!
//! ```text
//! Created -> Opening -> Opened -> Closing -> Closed
//!    \          \          \         /
//!     `----------`----------`-> Faulted
//! ```
//!
//! [`CommunicationObject`] owns the state and the per-phase hook flags; the
//! owner supplies the actual open/close/abort work through a
//! [`LifecycleHandler`].
//!
//! ## Lock Usage
//!
//! Uses `parking_lot::Mutex` for the state because:
//! - Transitions are computed and committed under the lock
//! - Handler callbacks always run after the lock is released
//! - The lock is never held across `.await` points

use crate::deadline::{within, Deadline};
use crate::error::{ChannelError, ChannelResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 16;

/// Lifecycle phase of a channel, factory or binder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommunicationState {
    /// Constructed, not yet opened
    Created,
    /// Open in progress
    Opening,
    /// Ready for use
    Opened,
    /// Close or abort in progress
    Closing,
    /// Terminal state
    Closed,
    /// Failed; only close or abort are meaningful
    Faulted,
}

impl fmt::Display for CommunicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Opening => "opening",
            Self::Opened => "opened",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Faulted => "faulted",
        };
        f.write_str(name)
    }
}

/// Transition notifications published by a [`CommunicationObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Entered `Opening`
    Opening,
    /// Entered `Opened`
    Opened,
    /// Entered `Closing`
    Closing,
    /// Entered `Closed`
    Closed,
    /// Entered `Faulted`
    Faulted,
}

/// Owner-supplied work run at each lifecycle phase
///
/// Phase hooks run at most once per object lifetime. `on_open` and
/// `on_close` are bounded by the deadline passed to them; `on_abort` must
/// not fail.
#[async_trait]
pub trait LifecycleHandler: Send + Sync {
    /// Runs after entering `Opening`, before `on_open`
    fn on_opening(&self) -> ChannelResult<()> {
        Ok(())
    }

    /// Actual open work
    async fn on_open(&self, deadline: Deadline) -> ChannelResult<()>;

    /// Runs after `on_open` succeeds, before entering `Opened`
    fn on_opened(&self) -> ChannelResult<()> {
        Ok(())
    }

    /// Runs after entering `Closing` on both close and abort
    fn on_closing(&self) -> ChannelResult<()> {
        Ok(())
    }

    /// Actual graceful close work
    async fn on_close(&self, deadline: Deadline) -> ChannelResult<()>;

    /// Release everything immediately
    fn on_abort(&self);

    /// Runs before entering `Closed` on both close and abort
    fn on_closed(&self) -> ChannelResult<()> {
        Ok(())
    }

    /// Runs once after entering `Faulted`
    fn on_faulted(&self) {}
}

#[derive(Debug, Clone, Copy)]
enum Hook {
    Opening = 1,
    Opened = 1 << 1,
    Closing = 1 << 2,
    Closed = 1 << 3,
}

#[derive(Debug)]
struct ObjectState {
    state: CommunicationState,
    aborted: bool,
    close_called: bool,
    hooks_fired: u8,
}

impl ObjectState {
    /// Mark `hook` fired, returning false if it already was
    fn claim(&mut self, hook: Hook) -> bool {
        let bit = hook as u8;
        let first = self.hooks_fired & bit == 0;
        self.hooks_fired |= bit;
        first
    }

    fn terminal_error(&self, object: &str) -> ChannelError {
        match self.state {
            CommunicationState::Faulted => ChannelError::faulted(object),
            _ if self.aborted => ChannelError::aborted(object),
            _ => ChannelError::closed(object),
        }
    }
}

/// Lifecycle state machine shared by channels, factories and binders
pub struct CommunicationObject {
    object: String,
    inner: Mutex<ObjectState>,
    events: broadcast::Sender<LifecycleEvent>,
}

impl fmt::Debug for CommunicationObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CommunicationObject")
            .field("object", &self.object)
            .field("state", &inner.state)
            .field("aborted", &inner.aborted)
            .finish()
    }
}

impl CommunicationObject {
    /// Create an object in the `Created` state; `object` names it in errors and logs
    pub fn new(object: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            object: object.into(),
            inner: Mutex::new(ObjectState {
                state: CommunicationState::Created,
                aborted: false,
                close_called: false,
                hooks_fired: 0,
            }),
            events,
        }
    }

    /// Name used in errors and logs
    pub fn object(&self) -> &str {
        &self.object
    }

    /// Current state
    pub fn state(&self) -> CommunicationState {
        self.inner.lock().state
    }

    /// Whether `abort` has been invoked
    pub fn is_aborted(&self) -> bool {
        self.inner.lock().aborted
    }

    /// Whether `close` has been invoked
    pub fn close_called(&self) -> bool {
        self.inner.lock().close_called
    }

    /// Error reported to callers once the object is no longer usable
    pub fn terminal_error(&self) -> ChannelError {
        self.inner.lock().terminal_error(&self.object)
    }

    /// Subscribe to transition notifications
    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: LifecycleEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn claim(&self, hook: Hook) -> bool {
        self.inner.lock().claim(hook)
    }

    /// Open the object: `Created -> Opening -> Opened`
    ///
    /// Any failure faults and aborts the object before being returned.
    pub async fn open<H>(&self, handler: &H, timeout: Duration) -> ChannelResult<()>
    where
        H: LifecycleHandler + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CommunicationState::Created => inner.state = CommunicationState::Opening,
                CommunicationState::Opening | CommunicationState::Opened => {
                    return Err(ChannelError::invalid_state(format!(
                        "{} has already been opened",
                        self.object
                    )));
                }
                _ => return Err(inner.terminal_error(&self.object)),
            }
        }
        debug!(object = %self.object, "Opening");

        let deadline = Deadline::after(timeout);
        if let Err(error) = self.run_open(handler, deadline).await {
            warn!(object = %self.object, error = %error, "Open failed");
            self.fault(handler);
            self.abort(handler);
            return Err(error);
        }
        Ok(())
    }

    async fn run_open<H>(&self, handler: &H, deadline: Deadline) -> ChannelResult<()>
    where
        H: LifecycleHandler + ?Sized,
    {
        if self.claim(Hook::Opening) {
            handler.on_opening()?;
            self.emit(LifecycleEvent::Opening);
        }

        within(deadline, "open", handler.on_open(deadline)).await?;

        {
            let mut inner = self.inner.lock();
            if inner.state != CommunicationState::Opening || !inner.claim(Hook::Opened) {
                return Err(inner.terminal_error(&self.object));
            }
        }
        handler.on_opened()?;

        let mut inner = self.inner.lock();
        if inner.state != CommunicationState::Opening {
            return Err(inner.terminal_error(&self.object));
        }
        inner.state = CommunicationState::Opened;
        drop(inner);

        debug!(object = %self.object, "Opened");
        self.emit(LifecycleEvent::Opened);
        Ok(())
    }

    /// Close the object gracefully: `Opened -> Closing -> Closed`
    ///
    /// From `Created`/`Opening` this aborts instead; from `Faulted` it aborts
    /// and reports the fault. Closing an object that is already closing or
    /// closed is a no-op.
    pub async fn close<H>(&self, handler: &H, timeout: Duration) -> ChannelResult<()>
    where
        H: LifecycleHandler + ?Sized,
    {
        let from = {
            let mut inner = self.inner.lock();
            let from = inner.state;
            match from {
                CommunicationState::Closing | CommunicationState::Closed => return Ok(()),
                CommunicationState::Opened => inner.state = CommunicationState::Closing,
                _ => {}
            }
            inner.close_called = true;
            from
        };

        match from {
            CommunicationState::Created | CommunicationState::Opening => {
                self.abort(handler);
                return Ok(());
            }
            CommunicationState::Faulted => {
                self.abort(handler);
                return Err(ChannelError::faulted(&self.object));
            }
            _ => {}
        }
        debug!(object = %self.object, "Closing");

        let deadline = Deadline::after(timeout);
        if let Err(error) = self.run_close(handler, deadline).await {
            warn!(object = %self.object, error = %error, "Close failed, aborting");
            self.abort(handler);
            return Err(error);
        }
        Ok(())
    }

    async fn run_close<H>(&self, handler: &H, deadline: Deadline) -> ChannelResult<()>
    where
        H: LifecycleHandler + ?Sized,
    {
        if self.claim(Hook::Closing) {
            handler.on_closing()?;
            self.emit(LifecycleEvent::Closing);
        }

        within(deadline, "close", handler.on_close(deadline)).await?;

        if self.claim(Hook::Closed) {
            handler.on_closed()?;
        }

        if self.finish_closed() {
            Ok(())
        } else {
            Err(ChannelError::aborted(&self.object))
        }
    }

    /// Release the object immediately, from any state, without failing
    ///
    /// Idempotent: aborting an object that is closed or already aborting
    /// does nothing.
    pub fn abort<H>(&self, handler: &H)
    where
        H: LifecycleHandler + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state == CommunicationState::Closed || inner.aborted {
                return;
            }
            inner.aborted = true;
            inner.state = CommunicationState::Closing;
        }
        debug!(object = %self.object, "Aborting");

        if self.claim(Hook::Closing) {
            match handler.on_closing() {
                Ok(()) => self.emit(LifecycleEvent::Closing),
                Err(error) => {
                    warn!(object = %self.object, error = %error, "Closing hook failed during abort");
                }
            }
        }

        handler.on_abort();

        if self.claim(Hook::Closed) {
            if let Err(error) = handler.on_closed() {
                warn!(object = %self.object, error = %error, "Closed hook failed during abort");
            }
        }

        self.finish_closed();
    }

    /// Enter `Closed`, returning false if an abort interrupted a graceful close
    fn finish_closed(&self) -> bool {
        let mut inner = self.inner.lock();
        let previous = inner.state;
        inner.state = CommunicationState::Closed;
        let graceful = !inner.aborted;
        drop(inner);

        if previous != CommunicationState::Closed {
            debug!(object = %self.object, aborted = !graceful, "Closed");
            self.emit(LifecycleEvent::Closed);
        }
        graceful
    }

    /// Move to `Faulted` and notify once
    ///
    /// Ignored once the object is closing, closed or already faulted.
    pub fn fault<H>(&self, handler: &H)
    where
        H: LifecycleHandler + ?Sized,
    {
        {
            let mut inner = self.inner.lock();
            match inner.state {
                CommunicationState::Closing
                | CommunicationState::Closed
                | CommunicationState::Faulted => return,
                _ => inner.state = CommunicationState::Faulted,
            }
        }
        warn!(object = %self.object, "Faulted");

        handler.on_faulted();
        self.emit(LifecycleEvent::Faulted);
    }

    /// Error unless the object is still usable (not closing, closed or faulted)
    pub fn throw_if_disposed(&self) -> ChannelResult<()> {
        let inner = self.inner.lock();
        match inner.state {
            CommunicationState::Created
            | CommunicationState::Opening
            | CommunicationState::Opened => Ok(()),
            _ => Err(inner.terminal_error(&self.object)),
        }
    }

    /// Error unless the object is still `Created` (settings may change)
    pub fn throw_if_disposed_or_immutable(&self) -> ChannelResult<()> {
        let inner = self.inner.lock();
        match inner.state {
            CommunicationState::Created => Ok(()),
            CommunicationState::Opening | CommunicationState::Opened => Err(
                ChannelError::invalid_state(format!("{} can no longer be modified", self.object)),
            ),
            _ => Err(inner.terminal_error(&self.object)),
        }
    }

    /// Error unless the object is `Opened`
    pub fn throw_if_disposed_or_not_open(&self) -> ChannelResult<()> {
        let inner = self.inner.lock();
        match inner.state {
            CommunicationState::Opened => Ok(()),
            CommunicationState::Created | CommunicationState::Opening => {
                Err(ChannelError::not_open(&self.object))
            }
            _ => Err(inner.terminal_error(&self.object)),
        }
    }

    /// Error while the object has not finished opening
    pub fn throw_if_not_opened(&self) -> ChannelResult<()> {
        match self.state() {
            CommunicationState::Created | CommunicationState::Opening => {
                Err(ChannelError::not_open(&self.object))
            }
            _ => Ok(()),
        }
    }

    /// Receive-style guard: `Opened` and `Closing` are both acceptable
    pub fn throw_if_closed_or_not_open(&self) -> ChannelResult<()> {
        let inner = self.inner.lock();
        match inner.state {
            CommunicationState::Opened | CommunicationState::Closing => Ok(()),
            CommunicationState::Created | CommunicationState::Opening => {
                Err(ChannelError::not_open(&self.object))
            }
            _ => Err(inner.terminal_error(&self.object)),
        }
    }

    /// Error if the object is faulted
    pub fn throw_if_faulted(&self) -> ChannelResult<()> {
        match self.state() {
            CommunicationState::Faulted => Err(ChannelError::faulted(&self.object)),
            _ => Ok(()),
        }
    }
}

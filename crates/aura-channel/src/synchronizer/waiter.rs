//! Queued demand for a channel
//!
//! A waiter is resolved exactly once through its oneshot slot. Waiters that
//! may trigger an open live in a separate FIFO from wait-only waiters so the
//! synchronizer can promote the oldest open-capable one to opener.

use crate::channel::Channel;
use crate::deadline::Deadline;
use crate::error::ChannelError;
use crate::masking::MaskingMode;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;

pub(crate) type WaiterId = u64;

/// Outcome delivered to a suspended caller
pub(crate) enum WaiterSignal<C> {
    /// A channel was opened; the caller now holds it
    Granted(Arc<C>),
    /// The caller must open a new channel itself
    BecomeOpener,
    /// No channel will be provided; report "no channel"
    Unavailable,
    /// The caller's deadline passed before it could be promoted
    TimedOut,
    /// The owner faulted
    Failed(ChannelError),
}

pub(crate) struct Waiter<C> {
    id: WaiterId,
    deadline: Deadline,
    masking: MaskingMode,
    slot: oneshot::Sender<WaiterSignal<C>>,
}

impl<C> Waiter<C> {
    /// Hand over a channel; false if the caller stopped waiting
    pub(crate) fn grant(self, channel: Arc<C>) -> bool {
        self.slot.send(WaiterSignal::Granted(channel)).is_ok()
    }

    /// Make this caller the opener; false if the caller stopped waiting
    pub(crate) fn promote(self) -> bool {
        self.slot.send(WaiterSignal::BecomeOpener).is_ok()
    }

    pub(crate) fn time_out(self) {
        let _ = self.slot.send(WaiterSignal::TimedOut);
    }

    pub(crate) fn close(self) {
        let _ = self.slot.send(WaiterSignal::Unavailable);
    }

    /// Fail the caller unless its masking absorbs `error`
    pub(crate) fn fault(self, error: ChannelError) {
        let signal = if self.masking.contains(MaskingMode::HANDLED) {
            WaiterSignal::Unavailable
        } else {
            WaiterSignal::Failed(error)
        };
        let _ = self.slot.send(signal);
    }
}

/// FIFO queues of suspended callers
pub(crate) struct WaiterQueues<C> {
    get_channel: VecDeque<Waiter<C>>,
    wait_only: VecDeque<Waiter<C>>,
    next_id: WaiterId,
}

impl<C: Channel> WaiterQueues<C> {
    pub(crate) fn new() -> Self {
        Self {
            get_channel: VecDeque::new(),
            wait_only: VecDeque::new(),
            next_id: 0,
        }
    }

    pub(crate) fn enqueue(
        &mut self,
        can_initiate_open: bool,
        deadline: Deadline,
        masking: MaskingMode,
    ) -> (WaiterId, oneshot::Receiver<WaiterSignal<C>>) {
        let (slot, receiver) = oneshot::channel();
        let id = self.next_id;
        self.next_id += 1;

        let waiter = Waiter {
            id,
            deadline,
            masking,
            slot,
        };
        if can_initiate_open {
            self.get_channel.push_back(waiter);
        } else {
            self.wait_only.push_back(waiter);
        }
        (id, receiver)
    }

    /// Remove waiter `id`; false if it was already dispatched
    pub(crate) fn remove(&mut self, id: WaiterId) -> bool {
        for queue in [&mut self.get_channel, &mut self.wait_only] {
            if let Some(position) = queue.iter().position(|waiter| waiter.id == id) {
                queue.remove(position);
                return true;
            }
        }
        false
    }

    /// Oldest open-capable waiter whose deadline has not passed
    ///
    /// Expired waiters skipped on the way are returned so the caller can
    /// resolve them outside the lock.
    pub(crate) fn pop_opener(&mut self) -> (Option<Waiter<C>>, Vec<Waiter<C>>) {
        let mut expired = Vec::new();
        while let Some(waiter) = self.get_channel.pop_front() {
            if waiter.deadline.is_expired() {
                expired.push(waiter);
            } else {
                return (Some(waiter), expired);
            }
        }
        (None, expired)
    }

    /// Every queued waiter, open-capable queue first, each in FIFO order
    pub(crate) fn drain_all(&mut self) -> Vec<Waiter<C>> {
        self.get_channel
            .drain(..)
            .chain(self.wait_only.drain(..))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.get_channel.len() + self.wait_only.len()
    }
}

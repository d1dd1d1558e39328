//! Aura Channel - Shared Channel Lifecycle and Fault Masking
//!
//! Lets many concurrent send/receive/request operations share one physical
//! channel without tracking its lifecycle themselves.
//!
//! # Architecture
//!
//! - [`CommunicationObject`]: the `Created -> Opening -> Opened -> Closing ->
//!   Closed` state machine (plus `Faulted`) every channel and binder follows
//! - [`ChannelSynchronizer`]: arbitrates the single shared channel, opening it
//!   on demand, queueing waiters, and retiring it after faults
//! - [`ChannelBinder`]: per-operation facade that acquires and returns the
//!   channel and classifies failures against a [`MaskingMode`]
//!
//! Transports plug in by implementing [`Channel`] and its shape capabilities
//! ([`OutputChannel`], [`InputChannel`], [`RequestChannel`], [`ReplyChannel`]).
//!
//! # Fault Handling
//!
//! - Handleable faults (communication, timeout) can be absorbed with
//!   [`MaskingMode::HANDLED`]
//! - Other failures can be redirected to [`BinderEvent::UnhandledError`] with
//!   [`MaskingMode::UNHANDLED`]
//! - A fault-tolerant binder survives inner channel faults by reconnecting
//!   through its [`ChannelFactory`]

#![forbid(unsafe_code)]

// === Core Modules ===

/// Per-operation binder over a shared channel
pub mod binder;

/// Physical channel contracts
pub mod channel;

/// Binder configuration
pub mod config;

/// Absolute deadlines for nested operations
pub mod deadline;

/// Unified error handling
pub mod error;

/// Communication object state machine
pub mod lifecycle;

/// Masking and fault tolerance policy
pub mod masking;

/// Shared channel arbitration
pub mod synchronizer;

/// In-memory channels and factories for tests
#[doc(hidden)]
pub mod testing;

// === Public API Re-exports ===

pub use binder::{BinderEvent, BoundRequestContext, ChannelBinder};
pub use channel::{
    Channel, ChannelFactory, DuplexChannel, FaultListener, FaultNotifier, InputChannel,
    ListenerId, OutputChannel, ReceiveOutcome, ReplyChannel, RequestChannel, RequestContext,
};
pub use config::BinderConfig;
pub use deadline::{within, Deadline};
pub use error::{ChannelError, ChannelErrorBuilder, ChannelResult, ErrorClass};
pub use lifecycle::{CommunicationObject, CommunicationState, LifecycleEvent, LifecycleHandler};
pub use masking::{FaultToleranceMode, MaskingMode};
pub use synchronizer::{
    ChannelAcquisition, ChannelSynchronizer, SynchronizerOwner, SynchronizerState,
};

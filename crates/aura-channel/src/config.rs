//! Binder Configuration
//!
//! Timeouts and masking/fault-tolerance policy consumed by
//! [`ChannelBinder`](crate::binder::ChannelBinder).

use crate::error::{ChannelError, ChannelResult};
use crate::masking::{FaultToleranceMode, MaskingMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a channel binder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinderConfig {
    /// Masking applied by the `*_default` operations
    pub default_masking_mode: MaskingMode,

    /// Whether inner channel faults are recoverable
    pub fault_tolerance_mode: FaultToleranceMode,

    /// Default budget for opening the binder
    pub open_timeout: Duration,

    /// Default budget for closing the binder, also used for channel teardown
    pub close_timeout: Duration,

    /// Default budget for a send
    pub send_timeout: Duration,

    /// Default budget for a receive
    pub receive_timeout: Duration,

    /// Acquire the first channel while opening so connection failures surface there
    pub connect_on_open: bool,

    /// Whether receive loops may initiate opening a new channel
    pub can_open_for_receive: bool,

    /// Capacity of the binder notification stream
    pub event_capacity: usize,
}

impl Default for BinderConfig {
    fn default() -> Self {
        Self {
            default_masking_mode: MaskingMode::NONE,
            fault_tolerance_mode: FaultToleranceMode::Never,
            open_timeout: Duration::from_secs(60),
            close_timeout: Duration::from_secs(60),
            send_timeout: Duration::from_secs(60),
            receive_timeout: Duration::from_secs(600),
            connect_on_open: true,
            can_open_for_receive: false,
            event_capacity: 64,
        }
    }
}

impl BinderConfig {
    /// Client side: reconnects through its factory after inner faults
    pub fn client() -> Self {
        Self {
            default_masking_mode: MaskingMode::HANDLED,
            fault_tolerance_mode: FaultToleranceMode::Always,
            can_open_for_receive: true,
            ..Default::default()
        }
    }

    /// Server side: channels are handed in by the listener
    pub fn server() -> Self {
        Self {
            default_masking_mode: MaskingMode::ALL,
            fault_tolerance_mode: FaultToleranceMode::IfNotSecuritySession,
            connect_on_open: false,
            can_open_for_receive: false,
            ..Default::default()
        }
    }

    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            open_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(5),
            receive_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Builder-style override of the fault tolerance mode
    pub fn with_fault_tolerance(mut self, mode: FaultToleranceMode) -> Self {
        self.fault_tolerance_mode = mode;
        self
    }

    /// Builder-style override of the default masking mode
    pub fn with_masking(mut self, mode: MaskingMode) -> Self {
        self.default_masking_mode = mode;
        self
    }

    /// Validate configuration settings
    pub fn validate(&self) -> ChannelResult<()> {
        if self.open_timeout.is_zero() {
            return Err(ChannelError::invalid_argument(
                "open_timeout must be greater than 0",
            ));
        }

        if self.close_timeout.is_zero() {
            return Err(ChannelError::invalid_argument(
                "close_timeout must be greater than 0",
            ));
        }

        if self.event_capacity == 0 {
            return Err(ChannelError::invalid_argument(
                "event_capacity must be greater than 0",
            ));
        }

        Ok(())
    }
}

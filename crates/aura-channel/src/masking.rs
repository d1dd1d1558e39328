//! Masking and fault-tolerance policy
//!
//! [`MaskingMode`] decides what a binder does with a failed operation:
//! handleable faults may be swallowed, and everything else may be redirected
//! to the `UnhandledError` notification instead of being returned. The two
//! bits are independent.

use crate::error::ChannelError;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Which failures a binder operation suppresses
    ///
    /// - `HANDLED`: communication and timeout failures are absorbed
    /// - `UNHANDLED`: other failures are reported through the binder's
    ///   notification stream instead of being returned
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct MaskingMode: u8 {
        /// Absorb handleable faults
        const HANDLED = 1 << 0;
        /// Redirect non-handleable faults to the notification stream
        const UNHANDLED = 1 << 1;
        /// Both bits
        const ALL = Self::HANDLED.bits() | Self::UNHANDLED.bits();
    }
}

impl MaskingMode {
    /// No masking: every failure is returned to the caller
    pub const NONE: Self = Self::empty();

    /// Whether `error` is absorbed silently under this mode
    pub fn absorbs(&self, error: &ChannelError) -> bool {
        self.contains(Self::HANDLED) && error.is_handleable()
    }

    /// Whether `error` is redirected to the notification stream under this mode
    pub fn redirects(&self, error: &ChannelError) -> bool {
        self.contains(Self::UNHANDLED) && !error.is_handleable()
    }
}

impl Default for MaskingMode {
    fn default() -> Self {
        Self::NONE
    }
}

/// Whether a binder survives faults of its inner channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FaultToleranceMode {
    /// Inner channel faults fault the binder
    #[default]
    Never,
    /// Tolerate inner faults unless the channel carries a security session
    IfNotSecuritySession,
    /// Always reconnect after an inner fault
    Always,
}

impl FaultToleranceMode {
    /// Resolve the mode for channels that do or do not carry a security session
    pub fn tolerates(&self, security_session: bool) -> bool {
        match self {
            Self::Never => false,
            Self::IfNotSecuritySession => !security_session,
            Self::Always => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_handled_bit_absorbs_only_handleable() {
        let comm = ChannelError::communication("reset");
        let timeout = ChannelError::timeout("send", Duration::from_secs(1));
        let protocol = ChannelError::protocol("bad frame");

        assert!(MaskingMode::HANDLED.absorbs(&comm));
        assert!(MaskingMode::HANDLED.absorbs(&timeout));
        assert!(!MaskingMode::HANDLED.absorbs(&protocol));
        assert!(!MaskingMode::NONE.absorbs(&comm));
    }

    #[test]
    fn test_unhandled_bit_redirects_only_non_handleable() {
        let comm = ChannelError::communication("reset");
        let protocol = ChannelError::protocol("bad frame");

        assert!(MaskingMode::UNHANDLED.redirects(&protocol));
        assert!(!MaskingMode::UNHANDLED.redirects(&comm));
        assert!(!MaskingMode::UNHANDLED.absorbs(&comm));
    }

    #[test]
    fn test_bits_are_independent() {
        let comm = ChannelError::communication("reset");
        let protocol = ChannelError::protocol("bad frame");

        assert_eq!(MaskingMode::ALL, MaskingMode::HANDLED | MaskingMode::UNHANDLED);
        assert!(MaskingMode::ALL.absorbs(&comm));
        assert!(!MaskingMode::ALL.redirects(&comm));
        assert!(MaskingMode::ALL.redirects(&protocol));
        assert!(!MaskingMode::ALL.absorbs(&protocol));
    }

    #[test]
    fn test_fault_tolerance_resolution() {
        assert!(!FaultToleranceMode::Never.tolerates(false));
        assert!(FaultToleranceMode::Always.tolerates(true));
        assert!(FaultToleranceMode::IfNotSecuritySession.tolerates(false));
        assert!(!FaultToleranceMode::IfNotSecuritySession.tolerates(true));
    }
}

//! Inbound request contexts bound to a binder's masking policy

use super::ChannelBinder;
use crate::channel::{Channel, RequestContext};
use crate::error::ChannelResult;
use crate::masking::MaskingMode;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Request context whose reply and close failures go through the binder's
/// exception handling
///
/// Produced by [`ChannelBinder::wrap_request_context`]. When the binder
/// neither tolerates faults nor masks anything, failures pass through
/// unchanged.
pub struct BoundRequestContext<C: Channel, R: RequestContext> {
    context: R,
    binder: ChannelBinder<C>,
    masking: MaskingMode,
    masked: bool,
}

impl<C: Channel, R: RequestContext> fmt::Debug for BoundRequestContext<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundRequestContext")
            .field("masking", &self.masking)
            .field("masked", &self.masked)
            .finish()
    }
}

impl<C: Channel, R: RequestContext> BoundRequestContext<C, R> {
    pub(super) fn new(context: R, binder: ChannelBinder<C>, masking: MaskingMode) -> Self {
        let masked = binder.tolerates_faults() || masking != MaskingMode::NONE;
        Self {
            context,
            binder,
            masking,
            masked,
        }
    }

    /// Masking applied to reply failures
    pub fn masking(&self) -> MaskingMode {
        self.masking
    }

    /// Whether failures are routed through the binder
    pub fn is_masked(&self) -> bool {
        self.masked
    }

    /// The wrapped context
    pub fn inner(&self) -> &R {
        &self.context
    }

    /// Unwrap the context
    pub fn into_inner(self) -> R {
        self.context
    }

    fn settle(&self, result: ChannelResult<()>) -> ChannelResult<()> {
        match result {
            Err(error) if self.masked && self.binder.handle_exception(&error, self.masking, false) => {
                Ok(())
            }
            other => other,
        }
    }
}

#[async_trait]
impl<C: Channel, R: RequestContext> RequestContext for BoundRequestContext<C, R> {
    type Message = R::Message;

    fn request_message(&self) -> &R::Message {
        self.context.request_message()
    }

    async fn reply(&self, message: R::Message, timeout: Duration) -> ChannelResult<()> {
        let result = self.context.reply(message, timeout).await;
        self.settle(result)
    }

    async fn close(&self, timeout: Duration) -> ChannelResult<()> {
        let result = self.context.close(timeout).await;
        self.settle(result)
    }

    fn abort(&self) {
        self.context.abort();
    }
}

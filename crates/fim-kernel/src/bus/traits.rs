use super::envelope::MessageEnvelope;
use super::error::BusResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Serves requests arriving on one subject.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Produces the reply for `request`. Failures are encoded in the reply headers.
    async fn handle(&self, request: MessageEnvelope) -> MessageEnvelope;
}

/// Subject-addressed request/reply transport.
#[async_trait]
pub trait RequestReplyBus: Send + Sync + 'static {
    /// Sends `request` to whoever serves `subject` and waits up to `timeout` for the reply.
    async fn request(
        &self,
        subject: &str,
        request: MessageEnvelope,
        timeout: Duration,
    ) -> BusResult<MessageEnvelope>;

    /// Registers `handler` as the single responder of `subject`.
    async fn serve(&self, subject: &str, handler: Arc<dyn RequestHandler>) -> BusResult<()>;

    /// Removes the responder of `subject`. Unknown subjects are ignored.
    async fn unserve(&self, subject: &str) -> BusResult<()>;
}

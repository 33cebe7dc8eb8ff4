use async_trait::async_trait;

use crate::error::HandlerError;
use crate::message::Message;

/// User processing logic for one message.
///
/// Invoked at most once at a time per session, in sequence order. A message
/// can be delivered again after a failure, a timeout or a lock loss, so
/// implementations must tolerate seeing the same `id` twice.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: &Message) -> Result<(), HandlerError>;
}

use crate::error::HandlerError;
use crate::message::Message;

/// What to do with a message whose handler failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Abandon it so the source redelivers it to the same session.
    Retry,
    /// Move it aside. The session continues with the next message.
    DeadLetter,
}

/// Decides the fate of a failed message. Called on a worker task, once per
/// failed attempt.
pub trait DeadLetterPolicy: Send + Sync + 'static {
    /// `attempts` is 1-based and includes the attempt that just failed.
    fn on_failure(&self, message: &Message, attempts: u32, error: &HandlerError) -> FailureAction;
}

/// Retry until `attempts` reaches the limit, then dead-letter.
#[derive(Debug, Clone, Copy)]
pub struct MaxAttempts(pub u32);

impl DeadLetterPolicy for MaxAttempts {
    fn on_failure(&self, _message: &Message, attempts: u32, _error: &HandlerError) -> FailureAction {
        if attempts >= self.0 {
            FailureAction::DeadLetter
        } else {
            FailureAction::Retry
        }
    }
}

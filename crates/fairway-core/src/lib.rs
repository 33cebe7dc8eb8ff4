pub mod codec;
pub mod engine;
pub mod error;
pub mod message;
pub mod source;
pub mod telemetry;

pub use codec::{Codec, EntityChange, JsonCodec};
pub use engine::{
    DeadLetterPolicy, DispatcherStats, Engine, EngineConfig, FailureAction, MaxAttempts,
    MessageHandler, RotationPolicy, ShutdownReport,
};
pub use error::{CodecError, EngineError, EngineResult, HandlerError, SourceError, SourceResult};
pub use message::{Delivery, LeaseToken, Message, MessageReceipt, OutboundMessage};
pub use source::{LockToken, LossNotifier, MemorySource, MemorySourceConfig, MessageSource, SessionLock};

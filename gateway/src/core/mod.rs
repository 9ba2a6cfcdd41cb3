pub mod broadcast;
pub mod control;
pub mod directory;
pub mod engine;
pub mod history;
pub mod lifecycle;
pub mod model;
pub mod notify;
pub mod service;
pub mod tts;

// Re-export commonly used types for convenience
pub use broadcast::{AggregateStatus, BroadcastRecord, BroadcastRequest, BroadcastStatus};
pub use control::{AmiClient, AmiClientConfig, CallControl, PeerEvent, SessionStatus};
pub use engine::{CallEngine, CallHandle, CallOutcome, CallSnapshot, EngineConfig, EngineStats};
pub use history::{BroadcastHistory, CallHistory, CallHistoryRecord};
pub use lifecycle::{CallState, CancelOutcome, FailureReason};
pub use model::{CallJob, ContactGroup, Extension, JobId, MessageSpec};
pub use notify::{EventNotifier, GatewayEvent, NotifierConfig};
pub use service::{CallRequest, PhoneService, ServiceParts};
pub use tts::{HttpSynthesizer, Synthesizer, TtsCache};

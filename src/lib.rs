pub mod config;
pub mod context;
pub mod directive;
pub mod engine;
pub mod error;
pub mod llm;
pub mod pacing;
pub mod scheduler;
pub mod store;
pub mod summarizer;

pub use config::EngineConfig;
pub use engine::{Engine, EngineEvent, Notification};
pub use error::{EngineError, EngineResult};
pub use llm::{ChatMessage, ChatTransport, LlmClient};
pub use scheduler::BackgroundScheduler;
pub use store::ConversationStore;

//! Dialog session orchestration.
//!
//! Ties the remote dialog engine, translation, speech output, and listening
//! together into one conversation, and drives the idle timeout.

pub mod entry;
pub mod session;
pub mod timeout;
pub mod translation;

pub use session::{
    Collaborators, DialogSessionManager, ManagerSettings, OpenOutcome, SendOptions, SessionPhase,
};
pub use timeout::{Activity, InteractionTimeoutScheduler, TimeoutSettings};
pub use translation::TranslationPipeline;

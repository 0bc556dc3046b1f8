//! Collaborator abstractions.
//!
//! The orchestration core talks to every external service through the traits
//! in this crate: the remote dialog engine ([`DialogEngine`]), the translation
//! backend ([`Translator`]), the speech synthesis provider
//! ([`SpeechSynthesizer`]), the platform audio context ([`AudioOutput`]) and
//! native speech fallback ([`NativeSpeech`]), and speech recognition
//! ([`SpeechRecognizer`]). HTTP implementations for the engine and translator
//! live in [`http`].

pub mod engine;
pub mod http;
pub mod recognition;
pub mod speech;
pub mod translate;

pub use engine::{DialogEngine, EngineReply, OpenSessionRequest};
pub use recognition::{RecognitionEvent, SpeechRecognizer, UnavailableRecognizer};
pub use speech::{
    AudioContextState, AudioFormat, AudioOutput, DecodedAudio, NativeSpeech, SpeechSynthesizer,
    SynthesisRequest, SynthesizedAudio,
};
pub use translate::Translator;

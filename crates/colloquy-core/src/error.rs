use thiserror::Error;

/// Engine result code reported when a session is unknown or has expired.
pub const RESULT_CODE_EXPIRED: i32 = 404;

#[derive(Debug, Error)]
pub enum ColloquyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Dialog engine error {code}: {message}")]
    Engine { code: i32, message: String },

    #[error("Session expired")]
    SessionExpired,

    #[error("No open session")]
    NoSession,

    #[error("Credentials required to open this session")]
    AuthRequired,

    #[error("Birth date required to open this session")]
    AgeVerificationRequired,

    #[error("User is below the minimum age of {min_age}")]
    Underage { min_age: u32 },

    #[error("Synthesis error: {0}")]
    Synthesis(String),

    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Recognition error: {0}")]
    Recognition(String),

    #[error("Preferences error: {0}")]
    Prefs(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ColloquyError {
    /// Map a non-zero engine result code onto the error taxonomy.
    pub fn from_result_code(code: i32, message: impl Into<String>) -> Self {
        match code {
            RESULT_CODE_EXPIRED => Self::SessionExpired,
            401 | 403 => Self::AuthRequired,
            _ => Self::Engine {
                code,
                message: message.into(),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, ColloquyError>;

//! Speech pipeline: synthesis with lip-sync, and recognition turn-taking.

pub mod animation;
pub mod listening;
pub mod synthesis;
pub mod text;
pub mod viseme;

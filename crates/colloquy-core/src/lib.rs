//! Core types, config, errors, event bus, and preferences for Colloquy.

pub mod config;
pub mod error;
pub mod events;
pub mod prefs;
pub mod types;

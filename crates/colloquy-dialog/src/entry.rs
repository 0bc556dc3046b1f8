//! Process-wide entry point for host code that drives the conversation
//! programmatically.
//!
//! The installed manager is held weakly: dropping the last strong handle
//! uninstalls it.

use std::sync::{Arc, OnceLock, PoisonError, RwLock, Weak};

use tracing::{debug, info};

use colloquy_core::error::{ColloquyError, Result};
use colloquy_core::events::WidgetEvent;

use crate::session::{DialogSessionManager, SendOptions};

static ENTRY: OnceLock<RwLock<Weak<DialogSessionManager>>> = OnceLock::new();

fn slot() -> &'static RwLock<Weak<DialogSessionManager>> {
    ENTRY.get_or_init(|| RwLock::new(Weak::new()))
}

/// Make `manager` the target of [`type_message`] and [`type_batch`].
pub fn install(manager: &Arc<DialogSessionManager>) {
    *slot().write().unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(manager);
    debug!("Dialog entry point installed");
}

pub fn uninstall() {
    *slot().write().unwrap_or_else(PoisonError::into_inner) = Weak::new();
}

fn current() -> Result<Arc<DialogSessionManager>> {
    slot()
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .upgrade()
        .ok_or(ColloquyError::NoSession)
}

/// Type a single message into the current session.
pub async fn type_message(text: &str) -> Result<()> {
    current()?
        .send_message(text, Vec::new(), SendOptions::default())
        .await
}

/// Type a sequence of messages, one after another.
///
/// Each message waits until the agent's spoken answer to the previous one
/// has finished. Host input is disabled for the duration of the batch and
/// re-enabled even when a message fails, which stops the batch.
pub async fn type_batch<I, S>(messages: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let manager = current()?;
    let bus = manager.bus().clone();
    bus.emit(WidgetEvent::InputDisabled { disabled: true });

    let mut result = Ok(());
    let mut sent = 0usize;
    for text in messages {
        if let Err(e) = manager
            .send_message(text.as_ref(), Vec::new(), SendOptions::default())
            .await
        {
            result = Err(e);
            break;
        }
        manager.speech().wait_idle().await;
        sent += 1;
    }

    info!(sent, "Scripted batch finished");
    bus.emit(WidgetEvent::InputDisabled { disabled: false });
    result
}

//! Interaction timeout: nudges the dialog engine when the user goes quiet.
//!
//! A single timer is live at a time. Every change in user, agent, audio, or
//! listening activity goes through [`InteractionTimeoutScheduler::reconcile`],
//! which clears the timer and arms a fresh one only when everything is idle.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use colloquy_core::config::Config;

#[derive(Debug, Clone)]
pub struct TimeoutSettings {
    pub base_min_seconds: u64,
    pub base_max_seconds: u64,
    /// Replaces the randomized window and reading time entirely.
    pub forced: Option<Duration>,
    pub reading_chars_per_minute: u32,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            base_min_seconds: 25,
            base_max_seconds: 40,
            forced: None,
            reading_chars_per_minute: 1000,
        }
    }
}

impl TimeoutSettings {
    pub fn from_config(config: &Config) -> Self {
        let (base_min_seconds, base_max_seconds) = config.timeout_window();
        Self {
            base_min_seconds,
            base_max_seconds,
            forced: config.forced_timeout(),
            reading_chars_per_minute: config.reading_chars_per_minute(),
        }
    }
}

/// What the user and the agent are currently doing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub user_typing: bool,
    pub agent_typing: bool,
    pub audio_playing: bool,
    pub listening: bool,
}

impl Activity {
    pub fn is_idle(&self) -> bool {
        !(self.user_typing || self.agent_typing || self.audio_playing || self.listening)
    }
}

/// Time needed to read `chars` characters at `chars_per_minute`.
pub fn reading_time(chars: usize, chars_per_minute: u32) -> Duration {
    if chars_per_minute == 0 {
        return Duration::ZERO;
    }
    Duration::from_secs_f64(chars as f64 * 60.0 / chars_per_minute as f64)
}

/// Deadline for the current emission.
///
/// A forced timeout wins. Otherwise the engine's own timeout, if the dialog
/// state carries one, replaces the randomized base window; reading time for
/// the emission is added on top.
pub fn compute_deadline(
    settings: &TimeoutSettings,
    emission: Option<&str>,
    engine_timeout: Option<u64>,
) -> Duration {
    if let Some(forced) = settings.forced {
        return forced;
    }

    let base = match engine_timeout {
        Some(seconds) if seconds > 0 => seconds,
        _ => {
            let min = settings.base_min_seconds.min(settings.base_max_seconds);
            let max = settings.base_min_seconds.max(settings.base_max_seconds);
            rand::rng().random_range(min..=max)
        }
    };

    let chars = emission.map(|e| e.chars().count()).unwrap_or(0);
    Duration::from_secs(base) + reading_time(chars, settings.reading_chars_per_minute)
}

/// Fired when an armed timer reaches its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub generation: u64,
}

pub struct InteractionTimeoutScheduler {
    settings: TimeoutSettings,
    generation: u64,
    armed: Option<CancellationToken>,
    tx: mpsc::UnboundedSender<TimerFired>,
}

impl InteractionTimeoutScheduler {
    pub fn new(settings: TimeoutSettings) -> (Self, mpsc::UnboundedReceiver<TimerFired>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                settings,
                generation: 0,
                armed: None,
                tx,
            },
            rx,
        )
    }

    /// Clear the timer, then arm a new one if nobody is active.
    ///
    /// Returns the deadline when a timer was armed.
    pub fn reconcile(
        &mut self,
        activity: Activity,
        emission: Option<&str>,
        engine_timeout: Option<u64>,
    ) -> Option<Duration> {
        self.clear();
        if !activity.is_idle() {
            trace!(?activity, "Interaction timer held");
            return None;
        }

        let deadline = compute_deadline(&self.settings, emission, engine_timeout);
        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.armed = Some(token.clone());

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    let _ = tx.send(TimerFired { generation });
                }
            }
        });

        debug!(generation, deadline_secs = deadline.as_secs_f64(), "Interaction timer armed");
        Some(deadline)
    }

    /// Cancel the live timer, if any.
    pub fn clear(&mut self) {
        if let Some(token) = self.armed.take() {
            token.cancel();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Accept a fire notification. Stale generations (cleared or replaced
    /// timers whose notification was already queued) are rejected.
    pub fn take_fired(&mut self, fired: TimerFired) -> bool {
        if self.armed.is_some() && fired.generation == self.generation {
            self.armed = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TimeoutSettings {
        TimeoutSettings::default()
    }

    #[test]
    fn test_reading_time() {
        assert_eq!(reading_time(1000, 1000), Duration::from_secs(60));
        assert_eq!(reading_time(50, 1000), Duration::from_secs(3));
        assert_eq!(reading_time(10, 0), Duration::ZERO);
    }

    #[test]
    fn test_deadline_in_window_plus_reading_time() {
        let emission = "x".repeat(100);
        for _ in 0..50 {
            let deadline = compute_deadline(&settings(), Some(&emission), None);
            assert!(deadline >= Duration::from_secs(31), "{deadline:?}");
            assert!(deadline <= Duration::from_secs(46), "{deadline:?}");
        }
    }

    #[test]
    fn test_forced_deadline_wins() {
        let settings = TimeoutSettings {
            forced: Some(Duration::from_secs(7)),
            ..settings()
        };
        assert_eq!(
            compute_deadline(&settings, Some("a long emission"), Some(90)),
            Duration::from_secs(7)
        );
    }

    #[test]
    fn test_engine_timeout_replaces_window() {
        assert_eq!(compute_deadline(&settings(), None, Some(10)), Duration::from_secs(10));
    }

    #[test]
    fn test_activity_idle() {
        assert!(Activity::default().is_idle());
        assert!(!Activity { listening: true, ..Default::default() }.is_idle());
        assert!(!Activity { audio_playing: true, ..Default::default() }.is_idle());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_when_idle() {
        let (mut scheduler, mut rx) = InteractionTimeoutScheduler::new(TimeoutSettings {
            forced: Some(Duration::from_secs(30)),
            ..settings()
        });
        scheduler.reconcile(Activity::default(), None, None);
        assert!(scheduler.is_armed());

        tokio::time::sleep(Duration::from_secs(31)).await;
        let fired = rx.recv().await.unwrap();
        assert!(scheduler.take_fired(fired));
        assert!(!scheduler.is_armed());
        assert!(!scheduler.take_fired(fired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activity_clears_timer() {
        let (mut scheduler, mut rx) = InteractionTimeoutScheduler::new(TimeoutSettings {
            forced: Some(Duration::from_secs(30)),
            ..settings()
        });
        scheduler.reconcile(Activity::default(), None, None);
        tokio::time::sleep(Duration::from_secs(20)).await;

        let busy = Activity {
            user_typing: true,
            ..Default::default()
        };
        assert!(scheduler.reconcile(busy, None, None).is_none());
        assert!(!scheduler.is_armed());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_rejects_stale_fire() {
        let (mut scheduler, mut rx) = InteractionTimeoutScheduler::new(TimeoutSettings {
            forced: Some(Duration::from_secs(5)),
            ..settings()
        });
        scheduler.reconcile(Activity::default(), None, None);
        tokio::time::sleep(Duration::from_secs(6)).await;
        let stale = rx.recv().await.unwrap();

        // Re-armed before the queued notification was handled.
        scheduler.reconcile(Activity::default(), None, None);
        assert!(!scheduler.take_fired(stale));
        assert!(scheduler.is_armed());
    }
}

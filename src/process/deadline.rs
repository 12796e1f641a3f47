//! Bounded-wait primitive used by every readiness loop

use crate::error::{PluginError, PluginResult};
use std::time::Duration;
use tokio::time::Instant;

/// Tracks elapsed/remaining time against an optional deadline.
///
/// A deadline without a duration never expires. It must be started exactly
/// once before it is queried.
#[derive(Debug, Clone)]
pub struct Deadline {
    duration: Option<Duration>,
    description: Option<String>,
    started_at: Option<Instant>,
}

impl Deadline {
    pub fn new(duration: Option<Duration>) -> Self {
        Self {
            duration,
            description: None,
            started_at: None,
        }
    }

    /// Label used in the timeout error instead of "After Ns"
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Create and start a deadline in one step
    pub fn started(duration: Duration, description: impl Into<String>) -> Self {
        Self {
            duration: Some(duration),
            description: Some(description.into()),
            started_at: Some(Instant::now()),
        }
    }

    pub fn start(&mut self) -> PluginResult<()> {
        if self.started_at.is_some() {
            return Err(PluginError::InvalidState("Timer already started".to_string()));
        }
        self.started_at = Some(Instant::now());
        Ok(())
    }

    pub fn elapsed(&self) -> PluginResult<Duration> {
        self.started_at
            .map(|t| t.elapsed())
            .ok_or_else(|| PluginError::InvalidState("Timer not started yet".to_string()))
    }

    /// Time left before expiry; `None` means "wait forever"
    pub fn remaining(&self) -> PluginResult<Option<Duration>> {
        let elapsed = self.elapsed()?;
        Ok(self.duration.map(|d| d.saturating_sub(elapsed)))
    }

    pub fn is_expired(&self) -> PluginResult<bool> {
        let elapsed = self.elapsed()?;
        Ok(self.duration.is_some_and(|d| elapsed >= d))
    }

    /// Sleep for at most `duration`, failing with `Timeout` if the deadline
    /// has already passed. Never sleeps past the deadline itself.
    pub async fn sleep(&self, duration: Duration) -> PluginResult<()> {
        if self.is_expired()? {
            return Err(self.timeout_error());
        }
        let duration = match self.remaining()? {
            Some(remaining) => duration.min(remaining),
            None => duration,
        };
        tokio::time::sleep(duration).await;
        Ok(())
    }

    pub fn timeout_error(&self) -> PluginError {
        let description = match (&self.description, self.duration) {
            (Some(description), _) => description.clone(),
            (None, Some(d)) => format!("After {}s", d.as_secs_f64()),
            (None, None) => "No deadline".to_string(),
        };
        PluginError::Timeout(description)
    }
}

//! Timeout guards.
//!
//! A guarded future that overruns is dropped, which cancels it; child
//! processes it owns are killed because they are spawned with `kill_on_drop`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{Error, Result};

/// Runs `work`, failing with [`Error::Timeout`] if it takes longer than `duration`.
pub async fn with_timeout<T, F>(duration: Duration, label: &str, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, work).await {
        Ok(result) => result,
        Err(_) => {
            tracing::error!(label, timeout_secs = duration.as_secs(), "timed out");
            Err(Error::Timeout {
                label: label.to_string(),
                after: duration,
            })
        }
    }
}

/// A fixed point in time shared by several guarded blocks.
///
/// Used for budgets that span more than one stage: every stage under the
/// deadline is cut off when it passes, and stages started after it fail
/// immediately.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// A deadline `budget` from now.
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before the deadline, zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Runs `work`, failing with [`Error::Timeout`] when the deadline passes.
    pub async fn guard<T, F>(&self, label: &str, work: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_expired() {
            tracing::error!(label, budget_secs = self.budget.as_secs(), "deadline already passed");
            return Err(Error::Timeout {
                label: label.to_string(),
                after: self.budget,
            });
        }
        match tokio::time::timeout_at(self.at, work).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(label, budget_secs = self.budget.as_secs(), "deadline passed");
                Err(Error::Timeout {
                    label: label.to_string(),
                    after: self.budget,
                })
            }
        }
    }
}

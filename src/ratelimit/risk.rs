//! Risk scoring collaborator interface.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;

/// Highest risk score.
pub const MAX_RISK_SCORE: u8 = 100;

/// Behavior statistics reported for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    /// Risk score in `0..=100`
    pub risk_score: u8,
}

/// Source of per-user risk scores.
///
/// Implemented by the behavior-analysis engine. `Ok(None)` means the engine
/// knows nothing about the user.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    /// Fetch the current activity statistics for a user.
    async fn user_activity_stats(&self, user_id: &str) -> Result<Option<ActivityStats>, CollaboratorError>;
}

/// Scorer that never has statistics; escalation never triggers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRiskScores;

#[async_trait]
impl RiskScorer for NoRiskScores {
    async fn user_activity_stats(&self, _user_id: &str) -> Result<Option<ActivityStats>, CollaboratorError> {
        Ok(None)
    }
}

/// Scores pushed in by the behavior-analysis engine and held in memory.
#[derive(Debug, Default)]
pub struct InMemoryRiskScores {
    scores: DashMap<String, u8>,
}

impl InMemoryRiskScores {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a score for a user, clamped to `0..=100`.
    pub fn set(&self, user_id: &str, score: u32) -> u8 {
        let score = score.min(u32::from(MAX_RISK_SCORE)) as u8;
        self.scores.insert(user_id.to_string(), score);
        score
    }

    /// Forget a user's score. Returns whether one was held.
    pub fn clear(&self, user_id: &str) -> bool {
        self.scores.remove(user_id).is_some()
    }

    /// Number of users with a score.
    pub fn len(&self) -> usize {
        self.scores.len()
    }

    /// Whether no scores are held.
    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[async_trait]
impl RiskScorer for InMemoryRiskScores {
    async fn user_activity_stats(&self, user_id: &str) -> Result<Option<ActivityStats>, CollaboratorError> {
        Ok(self
            .scores
            .get(user_id)
            .map(|score| ActivityStats { risk_score: *score }))
    }
}

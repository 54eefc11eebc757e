use super::{AdminError, AppState};
use crate::auth::AdminCapability;
use crate::types::*;

pub const KEY_POINTS: u32 = 100;
pub const REGENERATION_POINTS: u32 = 50;
pub const EUROS_PER_POINT: f64 = 0.01;

impl AppState {
    /// Rebuild a player's score from keys, actions and the bonus already awarded
    pub async fn recompute_score(&self, user_id: &str) -> PlayerScore {
        let key_count = self
            .keys
            .read()
            .await
            .keys()
            .filter(|(owner, _)| owner == user_id)
            .count() as u32;
        let action_count = self
            .regenerative_actions
            .read()
            .await
            .iter()
            .filter(|a| a.user_id == user_id)
            .count() as u32;

        let mut scores = self.scores.write().await;
        let score = scores
            .entry(user_id.to_string())
            .or_insert_with(|| PlayerScore::empty(user_id));
        score.keys_points = key_count * KEY_POINTS;
        score.regeneration_points = action_count * REGENERATION_POINTS;
        score.total_points = score.keys_points + score.regeneration_points + score.bonus_points;
        score.euros_value = score.total_points as f64 * EUROS_PER_POINT;

        tracing::debug!("Score of {} is now {}", user_id, score.total_points);
        score.clone()
    }

    pub async fn get_score(&self, user_id: &str) -> PlayerScore {
        self.scores
            .read()
            .await
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| PlayerScore::empty(user_id))
    }

    /// Add organiser bonus points on top of the earned score
    pub async fn award_bonus(
        &self,
        admin: &AdminCapability,
        user_id: &str,
        points: u32,
    ) -> Result<PlayerScore, AdminError> {
        if self.get_profile(user_id).await.is_none() {
            return Err(AdminError::UserNotFound(user_id.to_string()));
        }

        {
            let mut scores = self.scores.write().await;
            let score = scores
                .entry(user_id.to_string())
                .or_insert_with(|| PlayerScore::empty(user_id));
            score.bonus_points = score.bonus_points.saturating_add(points);
        }

        tracing::info!(
            "Admin {} awarded {} bonus points to {}",
            admin.user_id(),
            points,
            user_id
        );
        Ok(self.recompute_score(user_id).await)
    }
}

mod admin;
mod mission;
mod moderation;
mod player;
mod score;
mod submission;
mod validation;

pub use admin::{AdminError, HintTarget, HINT_PREFIX};
pub use mission::{default_missions, MissionUpdate};
pub use moderation::ModerationError;
pub use player::{NewProfile, NewRegenerativeAction, PlayerError, PlayerOverview, PositionFix};
pub use score::{EUROS_PER_POINT, KEY_POINTS, REGENERATION_POINTS};
pub use submission::{ProofUpload, SubmissionError};
pub use validation::{
    parse_similarity_score, similarity_prompt, ValidationError, ValidationOutcome, ValidationRun,
};

use crate::chat::ChatRelay;
use crate::geo::PositionReport;
use crate::llm::{LlmConfig, LlmProvider};
use crate::storage::{BlobStore, MemoryBlobStore};
use crate::types::*;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: GameConfig,
    pub profiles: Arc<RwLock<HashMap<UserId, Profile>>>,
    pub user_roles: Arc<RwLock<Vec<UserRole>>>,
    pub missions: Arc<RwLock<HashMap<MissionId, MissionConfig>>>,
    pub reference_images: Arc<RwLock<HashMap<ReferenceImageId, ReferenceImage>>>,
    pub submissions: Arc<RwLock<HashMap<SubmissionId, Submission>>>,
    /// Keyed by (user, mission): one completion row per pair
    pub progress: Arc<RwLock<HashMap<(UserId, MissionId), MissionProgress>>>,
    /// Keyed by (user, key type): a key is granted at most once
    pub keys: Arc<RwLock<HashMap<(UserId, KeyType), KeyRecord>>>,
    pub scores: Arc<RwLock<HashMap<UserId, PlayerScore>>>,
    pub regenerative_actions: Arc<RwLock<Vec<RegenerativeAction>>>,
    pub chat_messages: Arc<RwLock<Vec<ChatMessageRecord>>>,
    pub positions: Arc<RwLock<Vec<PlayerPosition>>>,
    pub blobs: Arc<dyn BlobStore>,
    /// Vision/chat model (None = AI features unavailable)
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub llm_config: LlmConfig,
    /// Submission status transitions, for dashboards and score refresh
    pub status_events: broadcast::Sender<SubmissionStatusChanged>,
    /// Live player positions and geolocation errors
    pub position_feed: broadcast::Sender<PositionReport>,
}

impl AppState {
    pub fn new() -> Self {
        let (status_tx, _rx) = broadcast::channel(256);
        let (position_tx, _rx) = broadcast::channel(256);

        let missions = default_missions()
            .into_iter()
            .map(|m| (m.mission_id.clone(), m))
            .collect();

        Self {
            config: GameConfig::default(),
            profiles: Arc::new(RwLock::new(HashMap::new())),
            user_roles: Arc::new(RwLock::new(Vec::new())),
            missions: Arc::new(RwLock::new(missions)),
            reference_images: Arc::new(RwLock::new(HashMap::new())),
            submissions: Arc::new(RwLock::new(HashMap::new())),
            progress: Arc::new(RwLock::new(HashMap::new())),
            keys: Arc::new(RwLock::new(HashMap::new())),
            scores: Arc::new(RwLock::new(HashMap::new())),
            regenerative_actions: Arc::new(RwLock::new(Vec::new())),
            chat_messages: Arc::new(RwLock::new(Vec::new())),
            positions: Arc::new(RwLock::new(Vec::new())),
            blobs: Arc::new(MemoryBlobStore::new()),
            llm: None,
            llm_config: LlmConfig::default(),
            status_events: status_tx,
            position_feed: position_tx,
        }
    }

    pub fn with_config(mut self, config: GameConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_blob_store(mut self, blobs: Arc<dyn BlobStore>) -> Self {
        self.blobs = blobs;
        self
    }

    pub fn with_llm(mut self, provider: Option<Arc<dyn LlmProvider>>, config: LlmConfig) -> Self {
        self.llm = provider;
        self.llm_config = config;
        self
    }

    /// Guide chat relay over the configured provider
    pub fn chat_relay(&self) -> Option<ChatRelay> {
        self.llm
            .as_ref()
            .map(|provider| ChatRelay::new(provider.clone(), self.llm_config.default_timeout))
    }

    pub fn subscribe_status_changes(&self) -> broadcast::Receiver<SubmissionStatusChanged> {
        self.status_events.subscribe()
    }

    /// Publish to dashboards; nobody listening is fine
    pub(crate) fn publish_status_change(&self, event: SubmissionStatusChanged) {
        let _ = self.status_events.send(event);
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_state_has_mission_catalogue() {
        let state = AppState::new();
        let missions = state.list_missions().await;
        assert_eq!(missions.len(), 6);
        assert_eq!(missions[0].mission_id, "pont-neuf");
        assert_eq!(missions[5].mission_id, "arc-triomphe");
        assert!(state.llm.is_none());
        assert!(state.chat_relay().is_none());
    }

    #[tokio::test]
    async fn test_status_events_reach_subscribers() {
        let state = AppState::new();
        let mut rx = state.subscribe_status_changes();
        let event = SubmissionStatusChanged {
            submission_id: "s".to_string(),
            mission_id: "pont-neuf".to_string(),
            user_id: "u".to_string(),
            previous: SubmissionStatus::Pending,
            status: SubmissionStatus::Approved,
            reviewer: Reviewer::Auto,
            at: chrono::Utc::now(),
        };
        state.publish_status_change(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }
}

use super::AppState;
use crate::chat::UserProgress;
use crate::geo::{FeedPositionSource, GeoError, GeofenceCheck, GeolocationWatcher, PositionReport};
use crate::types::*;
use chrono::Utc;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PlayerError {
    #[error("Unknown player {0}")]
    UnknownPlayer(UserId),

    #[error("A profile already exists for {0}")]
    EmailTaken(String),

    #[error("Invalid input: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProfile {
    pub email: String,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

/// A device fix as reported by a player
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionFix {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewRegenerativeAction {
    pub action_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub photo_url: Option<String>,
}

/// Everything the player dashboard shows
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerOverview {
    pub profile: Profile,
    pub current_day: u8,
    pub keys: Vec<KeyType>,
    pub completed_missions: Vec<MissionProgress>,
    pub score: PlayerScore,
}

impl PlayerOverview {
    /// What the guide chat needs to know about the player
    pub fn progress(&self) -> UserProgress {
        UserProgress {
            current_day: self.current_day,
            keys: self.keys.iter().map(|k| k.as_str().to_string()).collect(),
        }
    }
}

impl AppState {
    /// Sign up a player. Emails are unique, compared lower-cased.
    pub async fn create_profile(&self, new: NewProfile) -> Result<Profile, PlayerError> {
        let email = new.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(PlayerError::Invalid(format!("'{}' is not an email", new.email)));
        }

        let profile = {
            let mut profiles = self.profiles.write().await;
            if profiles.values().any(|p| p.email == email) {
                return Err(PlayerError::EmailTaken(email));
            }
            let now = Utc::now();
            let profile = Profile {
                id: ulid::Ulid::new().to_string(),
                email,
                team_name: new
                    .team_name
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty()),
                language: new.language,
                created_at: now,
                updated_at: now,
            };
            profiles.insert(profile.id.clone(), profile.clone());
            profile
        };

        self.grant_role(&profile.id, AppRole::User).await;
        if self.config.bootstrap_admin_email.as_deref() == Some(profile.email.as_str()) {
            tracing::info!("Bootstrap admin {} signed up", profile.email);
            self.grant_role(&profile.id, AppRole::Admin).await;
        }

        tracing::info!("Profile {} created for {}", profile.id, profile.email);
        Ok(profile)
    }

    pub async fn get_profile(&self, user_id: &str) -> Option<Profile> {
        self.profiles.read().await.get(user_id).cloned()
    }

    pub async fn find_profile_by_email(&self, email: &str) -> Option<Profile> {
        let email = email.trim().to_lowercase();
        self.profiles
            .read()
            .await
            .values()
            .find(|p| p.email == email)
            .cloned()
    }

    async fn require_profile(&self, user_id: &str) -> Result<Profile, PlayerError> {
        self.get_profile(user_id)
            .await
            .ok_or_else(|| PlayerError::UnknownPlayer(user_id.to_string()))
    }

    /// Store a fix and publish it to live followers. With a mission context,
    /// returns where the player stands relative to that mission's target.
    pub async fn report_position(
        &self,
        user_id: &str,
        fix: PositionFix,
        mission_context: Option<MissionId>,
    ) -> Result<Option<GeofenceCheck>, PlayerError> {
        self.require_profile(user_id).await?;
        let coords = Coords::new(fix.latitude, fix.longitude);
        if !coords.is_valid() {
            return Err(PlayerError::Invalid(format!(
                "({}, {}) is not a valid coordinate",
                fix.latitude, fix.longitude
            )));
        }

        let check = match &mission_context {
            Some(mission_id) => self.check_geofence(mission_id, coords).await,
            None => None,
        };

        self.positions.write().await.push(PlayerPosition {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            latitude: fix.latitude,
            longitude: fix.longitude,
            accuracy: fix.accuracy,
            mission_context,
            created_at: Utc::now(),
        });

        let _ = self.position_feed.send(PositionReport {
            user_id: user_id.to_string(),
            fix: Ok(coords),
        });
        Ok(check)
    }

    /// Relay a device-side geolocation failure to live followers
    pub async fn report_position_error(&self, user_id: &str, error: GeoError) -> Result<(), PlayerError> {
        self.require_profile(user_id).await?;
        tracing::debug!("Geolocation error for {}: {}", user_id, error);
        let _ = self.position_feed.send(PositionReport {
            user_id: user_id.to_string(),
            fix: Err(error),
        });
        Ok(())
    }

    pub async fn positions_for_user(&self, user_id: &str) -> Vec<PlayerPosition> {
        self.positions
            .read()
            .await
            .iter()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Follow one player's live position
    pub fn watch_player(&self, user_id: &str) -> GeolocationWatcher {
        let source = FeedPositionSource::new(self.position_feed.clone(), user_id.to_string());
        GeolocationWatcher::start(&source)
    }

    pub async fn record_regenerative_action(
        &self,
        user_id: &str,
        action: NewRegenerativeAction,
    ) -> Result<RegenerativeAction, PlayerError> {
        self.require_profile(user_id).await?;
        if action.action_type.trim().is_empty() {
            return Err(PlayerError::Invalid("action type is required".to_string()));
        }

        let record = RegenerativeAction {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            action_type: action.action_type.trim().to_string(),
            description: action.description,
            location: action.location,
            photo_url: action.photo_url,
            created_at: Utc::now(),
        };
        self.regenerative_actions.write().await.push(record.clone());
        self.recompute_score(user_id).await;

        tracing::info!("Player {} logged action {}", user_id, record.action_type);
        Ok(record)
    }

    /// Organiser messages and other persisted chat lines, oldest first
    pub async fn chat_history(&self, user_id: &str) -> Vec<ChatMessageRecord> {
        self.chat_messages
            .read()
            .await
            .iter()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect()
    }

    /// First day with an unfinished mission; the last day once all are done
    pub async fn current_day(&self, user_id: &str) -> u8 {
        let missions = self.list_missions().await;
        let progress = self.progress.read().await;
        missions
            .iter()
            .find(|m| {
                !progress
                    .get(&(user_id.to_string(), m.mission_id.clone()))
                    .is_some_and(|p| p.completed)
            })
            .or_else(|| missions.last())
            .map(|m| m.day)
            .unwrap_or(1)
    }

    pub async fn player_overview(&self, user_id: &str) -> Result<PlayerOverview, PlayerError> {
        let profile = self.require_profile(user_id).await?;
        let keys = self
            .keys_for_user(user_id)
            .await
            .into_iter()
            .map(|k| k.key_type)
            .collect();
        let completed_missions = self
            .progress_for_user(user_id)
            .await
            .into_iter()
            .filter(|p| p.completed)
            .collect();

        Ok(PlayerOverview {
            profile,
            current_day: self.current_day(user_id).await,
            keys,
            completed_missions,
            score: self.get_score(user_id).await,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::REGENERATION_POINTS;

    fn new_profile(email: &str) -> NewProfile {
        NewProfile {
            email: email.to_string(),
            team_name: Some(" Les Lucioles ".to_string()),
            language: Some("fr".to_string()),
        }
    }

    #[tokio::test]
    async fn test_create_profile() {
        let state = AppState::new();
        let profile = state
            .create_profile(new_profile(" Gardien@Example.FR "))
            .await
            .unwrap();
        assert_eq!(profile.email, "gardien@example.fr");
        assert_eq!(profile.team_name.as_deref(), Some("Les Lucioles"));
        assert!(!state.is_admin(&profile.id).await);

        let duplicate = state.create_profile(new_profile("gardien@example.fr")).await;
        assert_eq!(
            duplicate.unwrap_err(),
            PlayerError::EmailTaken("gardien@example.fr".to_string())
        );

        let invalid = state.create_profile(new_profile("pas-un-email")).await;
        assert!(matches!(invalid, Err(PlayerError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_bootstrap_admin() {
        let state = AppState::new().with_config(GameConfig {
            bootstrap_admin_email: Some("orga@example.fr".to_string()),
            ..GameConfig::default()
        });
        let orga = state
            .create_profile(new_profile("Orga@example.fr"))
            .await
            .unwrap();
        assert!(state.is_admin(&orga.id).await);
    }

    #[tokio::test]
    async fn test_report_position_checks_mission() {
        let state = AppState::new();
        let player = state.create_profile(new_profile("a@example.fr")).await.unwrap();

        let check = state
            .report_position(
                &player.id,
                PositionFix {
                    latitude: 48.8584,
                    longitude: 2.2946,
                    accuracy: Some(8.0),
                },
                Some("tour-eiffel".to_string()),
            )
            .await
            .unwrap()
            .unwrap();
        assert!(check.inside);
        assert_eq!(state.positions_for_user(&player.id).await.len(), 1);

        let unknown = state
            .report_position(
                "ghost",
                PositionFix {
                    latitude: 48.0,
                    longitude: 2.0,
                    accuracy: None,
                },
                None,
            )
            .await;
        assert_eq!(unknown, Err(PlayerError::UnknownPlayer("ghost".to_string())));

        let invalid = state
            .report_position(
                &player.id,
                PositionFix {
                    latitude: 123.0,
                    longitude: 2.0,
                    accuracy: None,
                },
                None,
            )
            .await;
        assert!(matches!(invalid, Err(PlayerError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_watch_player_follows_reports() {
        let state = AppState::new();
        let player = state.create_profile(new_profile("a@example.fr")).await.unwrap();
        let mut watcher = state.watch_player(&player.id);
        assert!(watcher.current().loading);

        state
            .report_position(
                &player.id,
                PositionFix {
                    latitude: 48.8462,
                    longitude: 2.3464,
                    accuracy: None,
                },
                None,
            )
            .await
            .unwrap();
        let update = watcher.changed().await.unwrap();
        assert_eq!(update.coords, Some(Coords::new(48.8462, 2.3464)));
        assert!(!update.loading);

        state
            .report_position_error(&player.id, GeoError::PermissionDenied)
            .await
            .unwrap();
        let update = watcher.changed().await.unwrap();
        assert_eq!(update.error, Some(GeoError::PermissionDenied));
        watcher.stop();
    }

    #[tokio::test]
    async fn test_regenerative_action_scores() {
        let state = AppState::new();
        let player = state.create_profile(new_profile("a@example.fr")).await.unwrap();

        state
            .record_regenerative_action(
                &player.id,
                NewRegenerativeAction {
                    action_type: "ramassage".to_string(),
                    description: Some("Berges de Seine".to_string()),
                    location: None,
                    photo_url: None,
                },
            )
            .await
            .unwrap();

        let overview = state.player_overview(&player.id).await.unwrap();
        assert_eq!(overview.score.regeneration_points, REGENERATION_POINTS);
        assert_eq!(overview.current_day, 1);
        assert!(overview.keys.is_empty());

        let blank = state
            .record_regenerative_action(
                &player.id,
                NewRegenerativeAction {
                    action_type: " ".to_string(),
                    description: None,
                    location: None,
                    photo_url: None,
                },
            )
            .await;
        assert!(matches!(blank, Err(PlayerError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_current_day_advances_with_progress() {
        let state = AppState::new();
        let player = state.create_profile(new_profile("a@example.fr")).await.unwrap();
        let now = Utc::now();
        for mission in ["pont-neuf", "pantheon"] {
            state.progress.write().await.insert(
                (player.id.clone(), mission.to_string()),
                MissionProgress {
                    id: mission.to_string(),
                    user_id: player.id.clone(),
                    mission_id: mission.to_string(),
                    day: 1,
                    completed: true,
                    validated_at: Some(now),
                    proof_url: None,
                    created_at: now,
                },
            );
        }
        assert_eq!(state.current_day(&player.id).await, 2);

        let overview = state.player_overview(&player.id).await.unwrap();
        assert_eq!(overview.completed_missions.len(), 2);
        assert_eq!(overview.progress().current_day, 2);
    }
}

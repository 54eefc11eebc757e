use super::AppState;
use crate::geo;
use crate::storage::check_image_payload;
use crate::types::*;
use axum::body::Bytes;

#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    #[error("Invalid image: {0}")]
    InvalidPayload(String),

    #[error("Unknown mission {0}")]
    UnknownMission(MissionId),

    #[error("No player profile for {0}")]
    UnknownPlayer(UserId),

    #[error("A position is required for this mission")]
    LocationRequired,

    #[error("({0}, {1}) is not a valid coordinate")]
    InvalidPosition(f64, f64),

    #[error("Position is {distance_m:.0} m from the target, outside the {radius_m:.0} m radius")]
    OutsideGeofence { distance_m: f64, radius_m: f64 },

    #[error("Photo upload failed: {0}")]
    StorageUploadFailed(String),

    /// The blob was stored but the record was not; the object stays behind
    #[error("Saving the submission failed: {reason} (orphaned blob {storage_key})")]
    PersistenceFailed { reason: String, storage_key: String },
}

/// A proof photo as received from a player
#[derive(Debug, Clone)]
pub struct ProofUpload {
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub image: Bytes,
    pub content_type: String,
    pub position: Option<Coords>,
}

impl AppState {
    /// Store the photo, then record a pending submission pointing at it
    pub async fn submit_proof(&self, upload: ProofUpload) -> Result<Submission, SubmissionError> {
        let ext = check_image_payload(&upload.image, &upload.content_type)
            .map_err(SubmissionError::InvalidPayload)?;
        let mission = self
            .get_mission(&upload.mission_id)
            .await
            .ok_or_else(|| SubmissionError::UnknownMission(upload.mission_id.clone()))?;
        if !self.profiles.read().await.contains_key(&upload.user_id) {
            return Err(SubmissionError::UnknownPlayer(upload.user_id));
        }
        if let Some(position) = upload.position.filter(|p| !p.is_valid()) {
            return Err(SubmissionError::InvalidPosition(position.lat, position.lng));
        }

        let check = match (mission.target, upload.position) {
            (Some(target), Some(position)) => {
                Some(geo::check_geofence(target, mission.radius_meters, position))
            }
            _ => None,
        };
        if self.config.enforce_geofence && mission.target.is_some() {
            match check {
                None => return Err(SubmissionError::LocationRequired),
                Some(c) if !c.inside => {
                    return Err(SubmissionError::OutsideGeofence {
                        distance_m: c.distance_m,
                        radius_m: c.radius_m,
                    })
                }
                Some(_) => {}
            }
        }

        // ULIDs lead with the millisecond timestamp
        let id = ulid::Ulid::new().to_string();
        let storage_key = format!("{}/{}-{}.{}", upload.user_id, upload.mission_id, id, ext);

        self.blobs
            .put(PROOF_BUCKET, &storage_key, upload.image, &upload.content_type)
            .await
            .map_err(|e| SubmissionError::StorageUploadFailed(e.to_string()))?;
        let photo_url = self.blobs.public_url(PROOF_BUCKET, &storage_key);

        // The player may have been removed while the upload ran
        if !self.profiles.read().await.contains_key(&upload.user_id) {
            tracing::warn!(
                "Proof blob {} stored but {} no longer has a profile, record not created",
                storage_key,
                upload.user_id
            );
            return Err(SubmissionError::PersistenceFailed {
                reason: format!("no profile for user {}", upload.user_id),
                storage_key,
            });
        }

        let now = chrono::Utc::now();
        let submission = Submission {
            id: id.clone(),
            mission_id: upload.mission_id,
            user_id: upload.user_id,
            kind: SubmissionKind::Photo,
            photo_url,
            storage_key,
            status: SubmissionStatus::Pending,
            ai_validation_result: None,
            ai_similarity_score: None,
            position: upload.position,
            distance_from_target: check.map(|c| c.distance_m),
            location_valid: check.map(|c| c.inside),
            reviewed_by: None,
            reviewed_at: None,
            created_at: now,
            updated_at: now,
        };

        self.submissions
            .write()
            .await
            .insert(id, submission.clone());

        tracing::info!(
            "Proof {} submitted by {} for mission {}",
            submission.id,
            submission.user_id,
            submission.mission_id
        );
        Ok(submission)
    }

    pub async fn get_submission(&self, submission_id: &str) -> Option<Submission> {
        self.submissions.read().await.get(submission_id).cloned()
    }

    /// A player's submissions, newest first
    pub async fn submissions_for_user(&self, user_id: &str) -> Vec<Submission> {
        let mut submissions: Vec<_> = self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        submissions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        submissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NewProfile;
    use crate::storage::{BlobStore, MemoryBlobStore, StorageResult};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    const AT_PONT_NEUF: Coords = Coords {
        lat: 48.8572,
        lng: 2.3414,
    };

    async fn player(state: &AppState) -> UserId {
        state
            .create_profile(NewProfile {
                email: "gardien@example.fr".to_string(),
                team_name: Some("Les Lucioles".to_string()),
                language: None,
            })
            .await
            .unwrap()
            .id
    }

    fn upload(user_id: &str, position: Option<Coords>) -> ProofUpload {
        ProofUpload {
            mission_id: "pont-neuf".to_string(),
            user_id: user_id.to_string(),
            image: Bytes::from_static(b"\xff\xd8\xff photo"),
            content_type: "image/jpeg".to_string(),
            position,
        }
    }

    #[tokio::test]
    async fn test_submit_proof_creates_pending_record() {
        let state = AppState::new();
        let user = player(&state).await;

        let submission = state
            .submit_proof(upload(&user, Some(AT_PONT_NEUF)))
            .await
            .unwrap();

        assert_eq!(submission.status, SubmissionStatus::Pending);
        assert_eq!(submission.kind, SubmissionKind::Photo);
        assert!(submission.storage_key.starts_with(&format!("{}/pont-neuf-", user)));
        assert!(submission.storage_key.ends_with(".jpg"));
        assert_eq!(submission.location_valid, Some(true));
        assert!(submission.distance_from_target.unwrap() < 100.0);
        assert!(state.blobs.exists(PROOF_BUCKET, &submission.storage_key).await);
        assert_eq!(state.submissions_for_user(&user).await.len(), 1);
    }

    #[tokio::test]
    async fn test_geofence_enforcement() {
        let state = AppState::new();
        let user = player(&state).await;

        let result = state.submit_proof(upload(&user, None)).await;
        assert!(matches!(result, Err(SubmissionError::LocationRequired)));

        let at_pantheon = Coords::new(48.8462, 2.3464);
        let result = state.submit_proof(upload(&user, Some(at_pantheon))).await;
        match result {
            Err(SubmissionError::OutsideGeofence {
                distance_m,
                radius_m,
            }) => {
                assert!(distance_m > 1000.0);
                assert_eq!(radius_m, DEFAULT_RADIUS_METERS);
            }
            other => panic!("expected OutsideGeofence, got {:?}", other),
        }
        assert!(state.submissions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_range_position_rejected() {
        let state = AppState::new();
        let user = player(&state).await;

        // Wraps onto the target in the trigonometry if not checked
        let wrapped = Coords::new(AT_PONT_NEUF.lat + 360.0, AT_PONT_NEUF.lng);
        let result = state.submit_proof(upload(&user, Some(wrapped))).await;
        assert!(matches!(result, Err(SubmissionError::InvalidPosition(_, _))));

        let result = state
            .submit_proof(upload(&user, Some(Coords::new(48.8572, 182.3414))))
            .await;
        assert!(matches!(result, Err(SubmissionError::InvalidPosition(_, _))));
        assert!(state.submissions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_geofence_recorded_when_not_enforced() {
        let state = AppState::new().with_config(GameConfig {
            enforce_geofence: false,
            ..GameConfig::default()
        });
        let user = player(&state).await;

        let far = state
            .submit_proof(upload(&user, Some(Coords::new(48.8462, 2.3464))))
            .await
            .unwrap();
        assert_eq!(far.location_valid, Some(false));

        let unknown = state.submit_proof(upload(&user, None)).await.unwrap();
        assert_eq!(unknown.location_valid, None);
        assert_eq!(unknown.distance_from_target, None);
    }

    #[tokio::test]
    async fn test_storage_failure_creates_no_record() {
        let blobs = Arc::new(MemoryBlobStore::new());
        blobs.reject_uploads(true);
        let state = AppState::new().with_blob_store(blobs);
        let user = player(&state).await;

        let result = state.submit_proof(upload(&user, Some(AT_PONT_NEUF))).await;
        assert!(matches!(result, Err(SubmissionError::StorageUploadFailed(_))));
        assert!(state.submissions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_player_stores_nothing() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let state = AppState::new().with_blob_store(blobs.clone());

        let result = state
            .submit_proof(upload("ghost", Some(AT_PONT_NEUF)))
            .await;
        assert!(matches!(result, Err(SubmissionError::UnknownPlayer(id)) if id == "ghost"));
        assert!(blobs.is_empty().await);
        assert!(state.submissions.read().await.is_empty());
    }

    /// Drops the player's profile once their photo is stored
    struct ProfileRemovingStore {
        inner: MemoryBlobStore,
        profiles: Arc<RwLock<HashMap<UserId, Profile>>>,
    }

    #[async_trait]
    impl BlobStore for ProfileRemovingStore {
        async fn put(
            &self,
            bucket: &str,
            key: &str,
            bytes: Bytes,
            content_type: &str,
        ) -> StorageResult<()> {
            self.inner.put(bucket, key, bytes, content_type).await?;
            self.profiles.write().await.clear();
            Ok(())
        }

        fn public_url(&self, bucket: &str, key: &str) -> String {
            self.inner.public_url(bucket, key)
        }

        async fn remove(&self, bucket: &str, keys: &[String]) -> StorageResult<()> {
            self.inner.remove(bucket, keys).await
        }

        async fn exists(&self, bucket: &str, key: &str) -> bool {
            self.inner.exists(bucket, key).await
        }
    }

    #[tokio::test]
    async fn test_persistence_failure_leaves_orphan_blob() {
        let state = AppState::new();
        let user = player(&state).await;
        let profiles = state.profiles.clone();
        let state = state.with_blob_store(Arc::new(ProfileRemovingStore {
            inner: MemoryBlobStore::new(),
            profiles,
        }));

        let result = state.submit_proof(upload(&user, Some(AT_PONT_NEUF))).await;
        let storage_key = match result {
            Err(SubmissionError::PersistenceFailed { storage_key, .. }) => storage_key,
            other => panic!("expected PersistenceFailed, got {:?}", other),
        };
        assert!(state.blobs.exists(PROOF_BUCKET, &storage_key).await);
        assert!(state.submissions.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_bad_payloads() {
        let state = AppState::new();
        let user = player(&state).await;

        let mut empty = upload(&user, Some(AT_PONT_NEUF));
        empty.image = Bytes::new();
        assert!(matches!(
            state.submit_proof(empty).await,
            Err(SubmissionError::InvalidPayload(_))
        ));

        let mut unknown = upload(&user, Some(AT_PONT_NEUF));
        unknown.mission_id = "louvre".to_string();
        assert!(matches!(
            state.submit_proof(unknown).await,
            Err(SubmissionError::UnknownMission(_))
        ));
    }
}

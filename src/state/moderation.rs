use super::AppState;
use crate::auth::AdminCapability;
use crate::types::*;
use chrono::Utc;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ModerationError {
    #[error("Submission {0} not found")]
    NotFound(SubmissionId),

    #[error("Submission was already {0:?}")]
    AlreadyDecided(SubmissionStatus),

    /// The status changed but the completion side effects did not all land
    #[error("Status updated but completion failed: {0}")]
    UpdateFailed(String),
}

impl AppState {
    /// Review queue for one status, newest first, with the author's profile
    pub async fn list_by_status(&self, status: SubmissionStatus) -> Vec<SubmissionWithProfile> {
        let mut submissions: Vec<Submission> = self
            .submissions
            .read()
            .await
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        submissions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let profiles = self.profiles.read().await;
        submissions
            .into_iter()
            .map(|submission| {
                let profile = profiles.get(&submission.user_id).map(|p| ProfileSummary {
                    email: p.email.clone(),
                    team_name: p.team_name.clone(),
                });
                SubmissionWithProfile {
                    submission,
                    profile,
                }
            })
            .collect()
    }

    /// Approve or reject a pending submission. Only the first decision wins;
    /// later ones get `AlreadyDecided`.
    pub async fn decide(
        &self,
        admin: &AdminCapability,
        submission_id: &str,
        approve: bool,
    ) -> Result<Submission, ModerationError> {
        let status = if approve {
            SubmissionStatus::Approved
        } else {
            SubmissionStatus::Rejected
        };
        tracing::info!(
            "Admin {} decides {:?} on submission {}",
            admin.user_id(),
            status,
            submission_id
        );
        self.transition_submission(
            submission_id,
            status,
            Reviewer::Admin(admin.user_id().to_string()),
            true,
        )
        .await
    }

    /// Force any status, including back to pending. Keys already granted stay granted.
    pub async fn override_status(
        &self,
        admin: &AdminCapability,
        submission_id: &str,
        status: SubmissionStatus,
    ) -> Result<Submission, ModerationError> {
        tracing::warn!(
            "Admin {} overrides submission {} to {:?}",
            admin.user_id(),
            submission_id,
            status
        );
        self.transition_submission(
            submission_id,
            status,
            Reviewer::Admin(admin.user_id().to_string()),
            false,
        )
        .await
    }

    /// Change a submission's status under the table lock. With `require_pending`
    /// the change only applies to pending submissions. Approval records mission
    /// completion and the mission key, then the change is published.
    pub(crate) async fn transition_submission(
        &self,
        submission_id: &str,
        status: SubmissionStatus,
        reviewer: Reviewer,
        require_pending: bool,
    ) -> Result<Submission, ModerationError> {
        let (updated, previous) = {
            let mut submissions = self.submissions.write().await;
            let submission = submissions
                .get_mut(submission_id)
                .ok_or_else(|| ModerationError::NotFound(submission_id.to_string()))?;

            if require_pending && submission.status != SubmissionStatus::Pending {
                return Err(ModerationError::AlreadyDecided(submission.status));
            }
            let previous = submission.status;
            if previous == status {
                return Ok(submission.clone());
            }

            let now = Utc::now();
            submission.status = status;
            if status.is_terminal() {
                submission.reviewed_by = Some(reviewer.clone());
                submission.reviewed_at = Some(now);
            } else {
                submission.reviewed_by = None;
                submission.reviewed_at = None;
            }
            submission.updated_at = now;
            (submission.clone(), previous)
        };

        let completion = if status == SubmissionStatus::Approved {
            self.record_completion(&updated).await
        } else {
            Ok(())
        };

        self.publish_status_change(SubmissionStatusChanged {
            submission_id: updated.id.clone(),
            mission_id: updated.mission_id.clone(),
            user_id: updated.user_id.clone(),
            previous,
            status,
            reviewer,
            at: updated.updated_at,
        });

        completion.map(|_| updated)
    }

    /// Upsert the mission's progress row and grant its key
    async fn record_completion(&self, submission: &Submission) -> Result<(), ModerationError> {
        let mission = self.get_mission(&submission.mission_id).await.ok_or_else(|| {
            ModerationError::UpdateFailed(format!(
                "mission {} no longer exists",
                submission.mission_id
            ))
        })?;
        let now = Utc::now();
        let user_id = submission.user_id.clone();

        self.progress
            .write()
            .await
            .entry((user_id.clone(), mission.mission_id.clone()))
            .and_modify(|progress| {
                if !progress.completed {
                    progress.completed = true;
                    progress.validated_at = Some(now);
                }
                progress.proof_url = Some(submission.photo_url.clone());
            })
            .or_insert_with(|| MissionProgress {
                id: ulid::Ulid::new().to_string(),
                user_id: user_id.clone(),
                mission_id: mission.mission_id.clone(),
                day: mission.day,
                completed: true,
                validated_at: Some(now),
                proof_url: Some(submission.photo_url.clone()),
                created_at: now,
            });

        if let Some(key_type) = mission.key_reward {
            let mut keys = self.keys.write().await;
            if !keys.contains_key(&(user_id.clone(), key_type)) {
                tracing::info!("Player {} collected the {} key", user_id, key_type.as_str());
                keys.insert(
                    (user_id.clone(), key_type),
                    KeyRecord {
                        id: ulid::Ulid::new().to_string(),
                        user_id: user_id.clone(),
                        key_type,
                        collected_at: now,
                    },
                );
            }
        }

        Ok(())
    }

    /// Keys a player holds, in collection order
    pub async fn keys_for_user(&self, user_id: &str) -> Vec<KeyRecord> {
        let mut keys: Vec<_> = self
            .keys
            .read()
            .await
            .values()
            .filter(|k| k.user_id == user_id)
            .cloned()
            .collect();
        keys.sort_by_key(|k| k.collected_at);
        keys
    }

    pub async fn progress_for_user(&self, user_id: &str) -> Vec<MissionProgress> {
        let mut progress: Vec<_> = self
            .progress
            .read()
            .await
            .values()
            .filter(|p| p.user_id == user_id)
            .cloned()
            .collect();
        progress.sort_by_key(|p| (p.day, p.created_at));
        progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{NewProfile, ProofUpload};
    use axum::body::Bytes;

    fn admin() -> AdminCapability {
        AdminCapability::granted("admin-1".to_string())
    }

    async fn pending_submission(state: &AppState, email: &str, mission_id: &str) -> Submission {
        let user = state
            .create_profile(NewProfile {
                email: email.to_string(),
                team_name: Some("Les Lucioles".to_string()),
                language: None,
            })
            .await
            .unwrap();
        let target = state.get_mission(mission_id).await.unwrap().target;
        state
            .submit_proof(ProofUpload {
                mission_id: mission_id.to_string(),
                user_id: user.id,
                image: Bytes::from_static(b"photo"),
                content_type: "image/jpeg".to_string(),
                position: target,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_by_status_joins_profile() {
        let state = AppState::new();
        let first = pending_submission(&state, "a@example.fr", "pont-neuf").await;
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = pending_submission(&state, "b@example.fr", "pantheon").await;

        let pending = state.list_by_status(SubmissionStatus::Pending).await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].submission.id, second.id);
        assert_eq!(pending[1].submission.id, first.id);
        let profile = pending[0].profile.as_ref().unwrap();
        assert_eq!(profile.email, "b@example.fr");
        assert_eq!(profile.team_name.as_deref(), Some("Les Lucioles"));

        assert!(state
            .list_by_status(SubmissionStatus::Approved)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_approve_grants_progress_and_key() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;

        let approved = state.decide(&admin(), &submission.id, true).await.unwrap();
        assert_eq!(approved.status, SubmissionStatus::Approved);
        assert_eq!(
            approved.reviewed_by,
            Some(Reviewer::Admin("admin-1".to_string()))
        );
        assert!(approved.reviewed_at.is_some());

        let progress = state.progress_for_user(&submission.user_id).await;
        assert_eq!(progress.len(), 1);
        assert_eq!(progress[0].day, 1);
        assert!(progress[0].completed);
        assert_eq!(progress[0].proof_url.as_deref(), Some(submission.photo_url.as_str()));

        let keys = state.keys_for_user(&submission.user_id).await;
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].key_type, KeyType::Eau);
    }

    #[tokio::test]
    async fn test_second_decision_is_refused() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;

        state.decide(&admin(), &submission.id, true).await.unwrap();
        let again = state.decide(&admin(), &submission.id, true).await;
        assert!(matches!(
            again,
            Err(ModerationError::AlreadyDecided(SubmissionStatus::Approved))
        ));
        let reject = state.decide(&admin(), &submission.id, false).await;
        assert!(matches!(reject, Err(ModerationError::AlreadyDecided(_))));

        assert_eq!(state.keys_for_user(&submission.user_id).await.len(), 1);
        assert_eq!(state.progress_for_user(&submission.user_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_approvals_grant_once() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "tour-eiffel").await;

        let cap_a = AdminCapability::granted("admin-a".to_string());
        let cap_b = AdminCapability::granted("admin-b".to_string());
        let (a, b) = tokio::join!(
            state.decide(&cap_a, &submission.id, true),
            state.decide(&cap_b, &submission.id, true)
        );
        assert!(a.is_ok() != b.is_ok());

        assert_eq!(state.keys_for_user(&submission.user_id).await.len(), 1);
        assert_eq!(state.progress_for_user(&submission.user_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_has_no_side_effects() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;

        let rejected = state.decide(&admin(), &submission.id, false).await.unwrap();
        assert_eq!(rejected.status, SubmissionStatus::Rejected);
        assert!(state.keys_for_user(&submission.user_id).await.is_empty());
        assert!(state.progress_for_user(&submission.user_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_submission() {
        let state = AppState::new();
        let result = state.decide(&admin(), "nope", true).await;
        assert!(matches!(result, Err(ModerationError::NotFound(id)) if id == "nope"));
    }

    #[tokio::test]
    async fn test_override_keeps_granted_key() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;
        state.decide(&admin(), &submission.id, true).await.unwrap();

        let reopened = state
            .override_status(&admin(), &submission.id, SubmissionStatus::Pending)
            .await
            .unwrap();
        assert_eq!(reopened.status, SubmissionStatus::Pending);
        assert!(reopened.reviewed_by.is_none());
        assert_eq!(state.keys_for_user(&submission.user_id).await.len(), 1);

        let rejected = state
            .override_status(&admin(), &submission.id, SubmissionStatus::Rejected)
            .await
            .unwrap();
        assert_eq!(rejected.status, SubmissionStatus::Rejected);

        let approved = state
            .override_status(&admin(), &submission.id, SubmissionStatus::Approved)
            .await
            .unwrap();
        assert_eq!(approved.status, SubmissionStatus::Approved);
        assert_eq!(state.keys_for_user(&submission.user_id).await.len(), 1);
        assert_eq!(state.progress_for_user(&submission.user_id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;
        let mut events = state.subscribe_status_changes();

        state.decide(&admin(), &submission.id, false).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.submission_id, submission.id);
        assert_eq!(event.previous, SubmissionStatus::Pending);
        assert_eq!(event.status, SubmissionStatus::Rejected);
        assert_eq!(event.reviewer, Reviewer::Admin("admin-1".to_string()));
    }

    #[tokio::test]
    async fn test_cascade_failure_is_reported() {
        let state = AppState::new();
        let submission = pending_submission(&state, "a@example.fr", "pont-neuf").await;
        state.missions.write().await.remove("pont-neuf");

        let result = state.decide(&admin(), &submission.id, true).await;
        assert!(matches!(result, Err(ModerationError::UpdateFailed(_))));
        // The status write itself went through
        assert_eq!(
            state.get_submission(&submission.id).await.unwrap().status,
            SubmissionStatus::Approved
        );
        assert!(state.keys_for_user(&submission.user_id).await.is_empty());
    }
}

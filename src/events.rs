use crate::state::AppState;
use crate::types::SubmissionStatus;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

/// Spawn a background task that refreshes a player's score whenever one of
/// their submissions is approved
pub fn spawn_score_refresher(state: Arc<AppState>) -> JoinHandle<()> {
    let mut events = state.subscribe_status_changes();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    // The next approval for the same player catches its score up
                    tracing::warn!("Score refresher lagged by {} events", skipped);
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            if event.status != SubmissionStatus::Approved {
                continue;
            }

            let score = state.recompute_score(&event.user_id).await;
            tracing::info!(
                "Score of {} refreshed to {} after submission {}",
                event.user_id,
                score.total_points,
                event.submission_id
            );
        }
    })
}

/// Score a freshly uploaded proof in the background. Failures only get logged;
/// the submission stays pending for manual review.
pub fn spawn_auto_validation(state: Arc<AppState>, submission_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        match state.auto_validate_submission(&submission_id).await {
            Ok(run) => tracing::info!(
                "Auto-validation of {}: validated={} score={:.2} status={:?}",
                submission_id,
                run.outcome.validated,
                run.outcome.similarity_score,
                run.submission.status
            ),
            Err(e) => tracing::warn!("Auto-validation of {} failed: {}", submission_id, e),
        }
    })
}

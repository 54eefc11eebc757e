//! Photo similarity scoring against a mission's reference images.

use super::{AppState, ModerationError};
use crate::llm::{GenerateRequest, LlmError};
use crate::types::*;
use serde::{Deserialize, Serialize};

const SIMILARITY_SYSTEM_PROMPT: &str = "Tu es l'arbitre photo d'un jeu de piste à Paris. \
On te montre deux images : la photo envoyée par un joueur, puis une photo de référence. \
Tu réponds uniquement par un nombre décimal entre 0.0 et 1.0, sans aucun autre texte.";

/// Scoring instructions with the anchored rubric, plus the mission's own hint
pub fn similarity_prompt(mission: &MissionConfig) -> String {
    let mut prompt = String::from(
        "Évalue la similarité entre ces deux images sur une échelle de 0.0 à 1.0.\n\
         Barème :\n\
         - 1.0 : même sujet, même angle de vue\n\
         - 0.8 à 0.9 : même sujet, angle différent\n\
         - 0.6 à 0.7 : même lieu ou même objet, avec des différences notables\n\
         - 0.4 à 0.5 : sujet semblable, contexte différent\n\
         - 0.0 à 0.3 : sujets différents\n",
    );
    prompt.push_str(&format!(
        "Lieu attendu : {} ({}).\n",
        mission.location, mission.title
    ));
    if let Some(hint) = &mission.ai_validation_prompt {
        prompt.push_str(&format!("Critère de l'organisateur : {}\n", hint));
    }
    prompt.push_str("Réponds uniquement par le score.");
    prompt
}

/// Similarity score in a model reply, when it can be read unambiguously.
///
/// Accepts a JSON `{"score": x}` object, or free text holding exactly one
/// number in 0..=1 once scale bounds ("0 à 1", "0.0-1.0", "/1") are set
/// aside. A comma is accepted as decimal separator.
pub fn parse_similarity_score(text: &str) -> Option<f64> {
    if let Ok(serde_json::Value::Object(fields)) = serde_json::from_str(text.trim()) {
        return fields.get("score").and_then(|v| v.as_f64()).filter(in_unit_range);
    }

    let spans = number_spans(text);
    let mut scale_bound = vec![false; spans.len()];
    for i in 1..spans.len() {
        let gap = text[spans[i - 1].1..spans[i].0].trim().to_lowercase();
        match gap.as_str() {
            "-" | "–" | "à" | "a" | "to" => {
                scale_bound[i - 1] = true;
                scale_bound[i] = true;
            }
            "/" | "sur" | "out of" => scale_bound[i] = true,
            _ => {}
        }
    }

    let mut candidates = spans
        .iter()
        .zip(scale_bound)
        .filter(|(_, bound)| !bound)
        .filter_map(|((start, end), _)| text[*start..*end].replace(',', ".").parse::<f64>().ok())
        .filter(in_unit_range);
    let score = candidates.next()?;
    candidates.next().is_none().then_some(score)
}

fn in_unit_range(score: &f64) -> bool {
    (0.0..=1.0).contains(score)
}

/// Byte ranges of the numbers in `text`, stripped of stray separators
fn number_spans(text: &str) -> Vec<(usize, usize)> {
    let mut raw = Vec::new();
    let mut start = None;
    for (i, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
        let numeric = c.is_ascii_digit() || c == '.' || c == ',';
        match (numeric, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                raw.push((s, i));
                start = None;
            }
            _ => {}
        }
    }

    raw.into_iter()
        .filter_map(|(s, e)| {
            let token = &text[s..e];
            let lead = token.len() - token.trim_start_matches(['.', ',']).len();
            let inner = token.trim_matches(['.', ',']);
            (!inner.is_empty()).then(|| (s + lead, s + lead + inner.len()))
        })
        .collect()
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    /// Provider quota exhausted; distinct from "no match"
    #[error("Crédits insuffisants pour la validation.")]
    InsufficientCredits,

    #[error("Unknown mission {0}")]
    UnknownMission(MissionId),

    #[error("Submission {0} not found")]
    SubmissionNotFound(SubmissionId),

    #[error("No vision model configured")]
    ProviderUnavailable,

    #[error("Submission already {0:?}")]
    AlreadyReviewed(SubmissionStatus),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValidationOutcome {
    pub validated: bool,
    pub similarity_score: f64,
    /// URL of the reference image that scored highest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_match: Option<String>,
    pub threshold: f64,
    pub reason: String,
    /// Comparisons that produced a score (0 = nothing could be scored)
    pub compared: usize,
}

impl ValidationOutcome {
    fn declined(threshold: f64, reason: &str) -> Self {
        Self {
            validated: false,
            similarity_score: 0.0,
            best_match: None,
            threshold,
            reason: reason.to_string(),
            compared: 0,
        }
    }
}

/// Result of validating a stored submission
#[derive(Debug, Clone)]
pub struct ValidationRun {
    pub outcome: ValidationOutcome,
    pub submission: Submission,
}

impl AppState {
    /// Score a photo against every reference image of the mission and apply
    /// the mission threshold. Nothing is written.
    pub async fn auto_validate(
        &self,
        mission_id: &str,
        photo_url: &str,
    ) -> Result<ValidationOutcome, ValidationError> {
        let references = self.list_reference_images(mission_id).await;
        let mission = self.get_mission(mission_id).await;
        let threshold = mission
            .as_ref()
            .map(|m| self.effective_threshold(m))
            .unwrap_or(self.config.default_similarity_threshold);

        if references.is_empty() {
            return Ok(ValidationOutcome::declined(
                threshold,
                "no reference images configured",
            ));
        }
        let mission =
            mission.ok_or_else(|| ValidationError::UnknownMission(mission_id.to_string()))?;
        if !mission.auto_validation_enabled {
            return Ok(ValidationOutcome::declined(threshold, "auto-validation disabled"));
        }
        let provider = self
            .llm
            .as_ref()
            .ok_or(ValidationError::ProviderUnavailable)?;

        let prompt = similarity_prompt(&mission);
        let mut best: Option<(f64, &ReferenceImage)> = None;
        let mut compared = 0;

        for reference in &references {
            let request = GenerateRequest {
                system_prompt: Some(SIMILARITY_SYSTEM_PROMPT.to_string()),
                prompt: prompt.clone(),
                image_urls: vec![photo_url.to_string(), reference.image_url.clone()],
                max_tokens: Some(self.llm_config.default_max_tokens),
                temperature: Some(0.1),
                timeout: self.llm_config.default_timeout,
            };

            let text = match provider.generate(request).await {
                Ok(response) => response.text,
                Err(LlmError::InsufficientCredits) => {
                    tracing::error!("Model credits exhausted while validating {}", mission_id);
                    return Err(ValidationError::InsufficientCredits);
                }
                Err(LlmError::RateLimit) => {
                    tracing::warn!("Rate limited on reference {}, skipping", reference.id);
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Comparison with reference {} failed: {}", reference.id, e);
                    continue;
                }
            };

            let Some(score) = parse_similarity_score(&text) else {
                tracing::warn!(
                    "Unreadable similarity for reference {}: {:?}",
                    reference.id,
                    text
                );
                continue;
            };

            compared += 1;
            tracing::debug!("Reference {} scored {:.2}", reference.id, score);
            if best.map_or(true, |(top, _)| score > top) {
                best = Some((score, reference));
            }
        }

        let similarity_score = best.map(|(score, _)| score).unwrap_or(0.0);
        let validated = compared > 0 && similarity_score >= threshold;
        let reason = if compared == 0 {
            "no reference image could be scored".to_string()
        } else if validated {
            format!(
                "similarity {:.2} meets threshold {:.2}",
                similarity_score, threshold
            )
        } else {
            format!(
                "similarity {:.2} below threshold {:.2}",
                similarity_score, threshold
            )
        };

        tracing::info!(
            "Auto-validation for mission {}: {} ({}/{} compared)",
            mission_id,
            reason,
            compared,
            references.len()
        );

        Ok(ValidationOutcome {
            validated,
            similarity_score,
            best_match: best.map(|(_, reference)| reference.image_url.clone()),
            threshold,
            reason,
            compared,
        })
    }

    /// Validate a stored submission, record the model's verdict on it and
    /// approve it when the threshold is met. Below threshold it stays pending
    /// for manual review.
    pub async fn auto_validate_submission(
        &self,
        submission_id: &str,
    ) -> Result<ValidationRun, ValidationError> {
        let submission = self
            .get_submission(submission_id)
            .await
            .ok_or_else(|| ValidationError::SubmissionNotFound(submission_id.to_string()))?;
        if submission.status != SubmissionStatus::Pending {
            return Err(ValidationError::AlreadyReviewed(submission.status));
        }

        let outcome = self
            .auto_validate(&submission.mission_id, &submission.photo_url)
            .await?;

        {
            let mut submissions = self.submissions.write().await;
            if let Some(record) = submissions.get_mut(submission_id) {
                record.ai_validation_result = serde_json::to_string(&outcome).ok();
                record.ai_similarity_score = Some(outcome.similarity_score);
                record.updated_at = chrono::Utc::now();
            }
        }

        if outcome.validated {
            match self
                .transition_submission(submission_id, SubmissionStatus::Approved, Reviewer::Auto, true)
                .await
            {
                Ok(_) => {}
                Err(ModerationError::AlreadyDecided(status)) => {
                    tracing::info!(
                        "Submission {} already {:?}, auto-approval skipped",
                        submission_id,
                        status
                    );
                }
                Err(e) => tracing::error!("Auto-approval of {} failed: {}", submission_id, e),
            }
        }

        let submission = self
            .get_submission(submission_id)
            .await
            .ok_or_else(|| ValidationError::SubmissionNotFound(submission_id.to_string()))?;
        Ok(ValidationRun {
            outcome,
            submission,
        })
    }
}

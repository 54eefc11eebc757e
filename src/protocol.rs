use crate::chat::UserProgress;
use crate::geo::{GeoError, GeoState, GeofenceCheck};
use crate::types::*;
use serde::{Deserialize, Serialize};

/// Messages pushed to dashboards over `/ws`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        following: Option<UserId>,
    },
    SubmissionStatus {
        #[serde(flatten)]
        change: SubmissionStatusChanged,
    },
    PlayerPosition {
        user_id: UserId,
        coords: Option<Coords>,
        loading: bool,
        error: Option<GeoError>,
    },
    Error {
        code: String,
        msg: String,
    },
}

impl ServerMessage {
    pub fn position(user_id: &str, state: GeoState) -> Self {
        ServerMessage::PlayerPosition {
            user_id: user_id.to_string(),
            coords: state.coords,
            loading: state.loading,
            error: state.error,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Also stream this player's live position
    pub follow: Option<UserId>,
}

/// Device location sent alongside a proof upload
#[derive(Debug, Deserialize)]
pub struct ProofQuery {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

impl ProofQuery {
    pub fn position(&self) -> Option<Coords> {
        match (self.lat, self.lng) {
            (Some(lat), Some(lng)) => Some(Coords::new(lat, lng)),
            _ => None,
        }
    }
}

/// Comma-separated labels attached to an uploaded reference image
#[derive(Debug, Default, Deserialize)]
pub struct ReferenceQuery {
    pub tags: Option<String>,
}

impl ReferenceQuery {
    pub fn tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags.as_deref().unwrap_or_default().split(',') {
            let tag = tag.trim();
            if !tag.is_empty() && !tags.iter().any(|t| t == tag) {
                tags.push(tag.to_string());
            }
        }
        tags
    }
}

/// Either a fix or the platform error code the device reported
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionRequest {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub accuracy: Option<f64>,
    pub mission_context: Option<MissionId>,
    pub error_code: Option<u16>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionResponse {
    pub recorded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub geofence: Option<GeofenceCheck>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatePhotoRequest {
    pub submission_photo_url: String,
    pub mission_id: MissionId,
    /// When set, the verdict is recorded on this submission
    pub submission_id: Option<SubmissionId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub user_progress: UserProgress,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default = "pending")]
    pub status: SubmissionStatus,
}

fn pending() -> SubmissionStatus {
    SubmissionStatus::Pending
}

#[derive(Debug, Deserialize)]
pub struct DecisionRequest {
    pub approve: bool,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub status: SubmissionStatus,
}

#[derive(Debug, Deserialize)]
pub struct AddAdminRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct HintRequest {
    /// Absent = every player
    pub team: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HintResponse {
    pub recipients: usize,
}

#[derive(Debug, Deserialize)]
pub struct BonusRequest {
    pub points: u32,
}

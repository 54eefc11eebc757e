use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque ID types for type safety
pub type UserId = String;
pub type MissionId = String;
pub type SubmissionId = String;
pub type ReferenceImageId = String;

/// Bucket holding player proof photos
pub const PROOF_BUCKET: &str = "mission-proofs";
/// Bucket holding administrator reference photos
pub const REFERENCE_BUCKET: &str = "mission-references";

/// Largest accepted image payload (8 MiB)
pub const MAX_IMAGE_BYTES: usize = 8 * 1024 * 1024;

/// Default acceptance radius around a mission target
pub const DEFAULT_RADIUS_METERS: f64 = 100.0;

/// Similarity required for auto-approval when a mission has no threshold set
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;

/// Upper bound on administrator accounts
pub const MAX_ADMINS: usize = 5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Coords {
    pub lat: f64,
    pub lng: f64,
}

impl Coords {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Latitude within ±90° and longitude within ±180°
    pub fn is_valid(&self) -> bool {
        (-90.0..=90.0).contains(&self.lat) && (-180.0..=180.0).contains(&self.lng)
    }
}

/// The four elemental keys a guardian can collect
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Eau,
    Temps,
    Air,
    Feu,
}

impl KeyType {
    pub const ALL: [KeyType; 4] = [KeyType::Eau, KeyType::Temps, KeyType::Air, KeyType::Feu];

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Eau => "eau",
            KeyType::Temps => "temps",
            KeyType::Air => "air",
            KeyType::Feu => "feu",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionConfig {
    pub mission_id: MissionId,
    pub day: u8,
    pub order_index: u32,
    pub title: String,
    pub location: String,
    pub description: String,
    pub key_reward: Option<KeyType>,
    pub requires_photo: bool,
    pub target: Option<Coords>,
    pub radius_meters: f64,
    pub auto_validation_enabled: bool,
    /// Minimum similarity (0..=1) for auto-approval; falls back to the game default
    pub similarity_threshold: Option<f64>,
    pub ai_validation_prompt: Option<String>,
    pub code_verb: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferenceImage {
    pub id: ReferenceImageId,
    pub mission_id: MissionId,
    pub image_url: String,
    pub storage_key: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Approved,
    Rejected,
}

impl SubmissionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SubmissionStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionKind {
    Photo,
}

/// Who moved a submission out of (or back into) `pending`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Reviewer {
    Auto,
    Admin(UserId),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub id: SubmissionId,
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub kind: SubmissionKind,
    pub photo_url: String,
    pub storage_key: String,
    pub status: SubmissionStatus,
    pub ai_validation_result: Option<String>,
    pub ai_similarity_score: Option<f64>,
    pub position: Option<Coords>,
    pub distance_from_target: Option<f64>,
    pub location_valid: Option<bool>,
    pub reviewed_by: Option<Reviewer>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Profile fields joined onto a submission for the review queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub email: String,
    pub team_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionWithProfile {
    #[serde(flatten)]
    pub submission: Submission,
    pub profile: Option<ProfileSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissionProgress {
    pub id: String,
    pub user_id: UserId,
    pub mission_id: MissionId,
    pub day: u8,
    pub completed: bool,
    pub validated_at: Option<DateTime<Utc>>,
    pub proof_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub user_id: UserId,
    pub key_type: KeyType,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlayerScore {
    pub user_id: UserId,
    pub total_points: u32,
    pub keys_points: u32,
    pub regeneration_points: u32,
    pub bonus_points: u32,
    pub euros_value: f64,
}

impl PlayerScore {
    pub fn empty(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            total_points: 0,
            keys_points: 0,
            regeneration_points: 0,
            bonus_points: 0,
            euros_value: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegenerativeAction {
    pub id: String,
    pub user_id: UserId,
    pub action_type: String,
    pub description: Option<String>,
    pub location: Option<String>,
    pub photo_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub email: String,
    pub team_name: Option<String>,
    pub language: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AppRole {
    Admin,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRole {
    pub id: String,
    pub user_id: UserId,
    pub role: AppRole,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AdminEntry {
    pub id: String,
    pub user_id: UserId,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamSummary {
    pub team_name: String,
    pub player_count: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One turn of a guide conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Persisted chat line (organiser hints land here)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessageRecord {
    pub id: String,
    pub user_id: UserId,
    pub role: ChatRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerPosition {
    pub id: String,
    pub user_id: UserId,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub mission_context: Option<MissionId>,
    pub created_at: DateTime<Utc>,
}

/// Emitted on every submission status transition, automatic or human
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmissionStatusChanged {
    pub submission_id: SubmissionId,
    pub mission_id: MissionId,
    pub user_id: UserId,
    pub previous: SubmissionStatus,
    pub status: SubmissionStatus,
    pub reviewer: Reviewer,
    pub at: DateTime<Utc>,
}

/// Game-wide settings
#[derive(Debug, Clone)]
pub struct GameConfig {
    /// Reject proofs taken outside the mission radius
    pub enforce_geofence: bool,
    pub default_similarity_threshold: f64,
    /// Profile email that is granted the admin role on sign-up
    pub bootstrap_admin_email: Option<String>,
    /// Run the similarity pass right after a proof is stored
    pub auto_validate_on_upload: bool,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            enforce_geofence: true,
            default_similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            bootstrap_admin_email: None,
            auto_validate_on_upload: true,
        }
    }
}

impl GameConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let enforce_geofence = std::env::var("ENFORCE_GEOFENCE")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(defaults.enforce_geofence);
        let auto_validate_on_upload = std::env::var("AUTO_VALIDATE_ON_UPLOAD")
            .map(|v| v != "0" && v.to_lowercase() != "false")
            .unwrap_or(defaults.auto_validate_on_upload);
        let default_similarity_threshold = std::env::var("DEFAULT_SIMILARITY_THRESHOLD")
            .ok()
            .and_then(|s| s.trim().parse::<f64>().ok())
            .filter(|t| (0.0..=1.0).contains(t))
            .unwrap_or(defaults.default_similarity_threshold);
        let bootstrap_admin_email = std::env::var("BOOTSTRAP_ADMIN_EMAIL")
            .ok()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        Self {
            enforce_geofence,
            default_similarity_threshold,
            bootstrap_admin_email,
            auto_validate_on_upload,
        }
    }
}

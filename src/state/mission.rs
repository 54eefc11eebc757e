use super::{AdminError, AppState};
use crate::auth::AdminCapability;
use crate::geo::{self, GeofenceCheck};
use crate::storage::check_image_payload;
use crate::types::*;
use axum::body::Bytes;
use serde::Deserialize;

fn mission(
    mission_id: &str,
    day: u8,
    order_index: u32,
    title: &str,
    location: &str,
    description: &str,
    key_reward: Option<KeyType>,
    target: Coords,
) -> MissionConfig {
    MissionConfig {
        mission_id: mission_id.to_string(),
        day,
        order_index,
        title: title.to_string(),
        location: location.to_string(),
        description: description.to_string(),
        key_reward,
        requires_photo: true,
        target: Some(target),
        radius_meters: DEFAULT_RADIUS_METERS,
        auto_validation_enabled: true,
        similarity_threshold: None,
        ai_validation_prompt: None,
        code_verb: None,
    }
}

/// The three-day parcours seeded into every new game
pub fn default_missions() -> Vec<MissionConfig> {
    vec![
        mission(
            "pont-neuf",
            1,
            1,
            "Le gardien de l'eau",
            "Pont-Neuf",
            "Photographie le plus vieux pont de Paris depuis la berge.",
            Some(KeyType::Eau),
            Coords::new(48.8571, 2.3413),
        ),
        mission(
            "pantheon",
            1,
            2,
            "Le pendule du temps",
            "Panthéon",
            "Retrouve la coupole où Foucault a prouvé que la Terre tourne.",
            Some(KeyType::Temps),
            Coords::new(48.8462, 2.3464),
        ),
        mission(
            "musee-orsay",
            2,
            1,
            "L'horloge de la gare",
            "Musée d'Orsay",
            "Capture la grande horloge qui regarde la Seine.",
            None,
            Coords::new(48.8600, 2.3266),
        ),
        mission(
            "tour-eiffel",
            2,
            2,
            "Le souffle de fer",
            "Tour Eiffel",
            "Photographie la tour depuis le Champ-de-Mars.",
            Some(KeyType::Air),
            Coords::new(48.8584, 2.2945),
        ),
        mission(
            "place-vendome",
            3,
            1,
            "La colonne de bronze",
            "Place Vendôme",
            "Trouve la colonne fondue dans le bronze des canons.",
            Some(KeyType::Feu),
            Coords::new(48.8676, 2.3294),
        ),
        mission(
            "arc-triomphe",
            3,
            2,
            "La flamme éternelle",
            "Arc de Triomphe",
            "Rejoins la flamme sous l'arche pour sceller les quatre clés.",
            None,
            Coords::new(48.8738, 2.2950),
        ),
    ]
}

/// Partial mission edit; absent fields are left untouched
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MissionUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub target: Option<Coords>,
    pub radius_meters: Option<f64>,
    pub auto_validation_enabled: Option<bool>,
    pub similarity_threshold: Option<f64>,
    pub ai_validation_prompt: Option<String>,
    pub code_verb: Option<String>,
}

impl MissionUpdate {
    fn validate(&self) -> Result<(), AdminError> {
        if let Some(radius) = self.radius_meters {
            if !radius.is_finite() || radius <= 0.0 {
                return Err(AdminError::Invalid(format!(
                    "radius must be positive, got {}",
                    radius
                )));
            }
        }
        if let Some(threshold) = self.similarity_threshold {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(AdminError::Invalid(format!(
                    "similarity threshold must be within 0..=1, got {}",
                    threshold
                )));
            }
        }
        if let Some(target) = self.target {
            if !target.is_valid() {
                return Err(AdminError::Invalid(format!(
                    "target ({}, {}) is not a valid coordinate",
                    target.lat, target.lng
                )));
            }
        }
        Ok(())
    }
}

impl AppState {
    /// All missions, by day then order within the day
    pub async fn list_missions(&self) -> Vec<MissionConfig> {
        let mut missions: Vec<_> = self.missions.read().await.values().cloned().collect();
        missions.sort_by_key(|m| (m.day, m.order_index));
        missions
    }

    pub async fn get_mission(&self, mission_id: &str) -> Option<MissionConfig> {
        self.missions.read().await.get(mission_id).cloned()
    }

    /// Similarity required for auto-approval of this mission
    pub fn effective_threshold(&self, mission: &MissionConfig) -> f64 {
        mission
            .similarity_threshold
            .unwrap_or(self.config.default_similarity_threshold)
    }

    pub async fn update_mission(
        &self,
        admin: &AdminCapability,
        mission_id: &str,
        update: MissionUpdate,
    ) -> Result<MissionConfig, AdminError> {
        update.validate()?;

        let mut missions = self.missions.write().await;
        let mission = missions
            .get_mut(mission_id)
            .ok_or_else(|| AdminError::NotFound(format!("mission {}", mission_id)))?;

        if let Some(title) = update.title {
            mission.title = title;
        }
        if let Some(description) = update.description {
            mission.description = description;
        }
        if let Some(target) = update.target {
            mission.target = Some(target);
        }
        if let Some(radius) = update.radius_meters {
            mission.radius_meters = radius;
        }
        if let Some(enabled) = update.auto_validation_enabled {
            mission.auto_validation_enabled = enabled;
        }
        if let Some(threshold) = update.similarity_threshold {
            mission.similarity_threshold = Some(threshold);
        }
        if let Some(prompt) = update.ai_validation_prompt {
            mission.ai_validation_prompt = Some(prompt).filter(|p| !p.trim().is_empty());
        }
        if let Some(verb) = update.code_verb {
            mission.code_verb = Some(verb).filter(|v| !v.trim().is_empty());
        }

        tracing::info!("Admin {} updated mission {}", admin.user_id(), mission_id);
        Ok(mission.clone())
    }

    /// Distance from a mission's target; None when the mission has no target
    pub async fn check_geofence(&self, mission_id: &str, position: Coords) -> Option<GeofenceCheck> {
        let mission = self.get_mission(mission_id).await?;
        mission
            .target
            .map(|target| geo::check_geofence(target, mission.radius_meters, position))
    }

    pub async fn add_reference_image(
        &self,
        admin: &AdminCapability,
        mission_id: &str,
        image: Bytes,
        content_type: &str,
        tags: Vec<String>,
    ) -> Result<ReferenceImage, AdminError> {
        if self.get_mission(mission_id).await.is_none() {
            return Err(AdminError::NotFound(format!("mission {}", mission_id)));
        }
        let ext = check_image_payload(&image, content_type).map_err(AdminError::Invalid)?;

        // ULIDs lead with the millisecond timestamp
        let id = ulid::Ulid::new().to_string();
        let storage_key = format!("{}/{}.{}", mission_id, id, ext);
        self.blobs
            .put(REFERENCE_BUCKET, &storage_key, image, content_type)
            .await
            .map_err(|e| AdminError::Storage(e.to_string()))?;

        let reference = ReferenceImage {
            id: id.clone(),
            mission_id: mission_id.to_string(),
            image_url: self.blobs.public_url(REFERENCE_BUCKET, &storage_key),
            storage_key,
            tags,
            created_at: chrono::Utc::now(),
        };
        self.reference_images
            .write()
            .await
            .insert(id, reference.clone());

        tracing::info!(
            "Admin {} added reference image {} to mission {}",
            admin.user_id(),
            reference.id,
            mission_id
        );
        Ok(reference)
    }

    /// Reference images of a mission, newest first
    pub async fn list_reference_images(&self, mission_id: &str) -> Vec<ReferenceImage> {
        let mut references: Vec<_> = self
            .reference_images
            .read()
            .await
            .values()
            .filter(|r| r.mission_id == mission_id)
            .cloned()
            .collect();
        references.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        references
    }

    /// Remove the blob first, then the row
    pub async fn delete_reference_image(
        &self,
        admin: &AdminCapability,
        reference_id: &str,
    ) -> Result<(), AdminError> {
        let storage_key = self
            .reference_images
            .read()
            .await
            .get(reference_id)
            .map(|r| r.storage_key.clone())
            .ok_or_else(|| AdminError::NotFound(format!("reference image {}", reference_id)))?;

        self.blobs
            .remove(REFERENCE_BUCKET, &[storage_key])
            .await
            .map_err(|e| AdminError::Storage(e.to_string()))?;
        self.reference_images.write().await.remove(reference_id);

        tracing::info!(
            "Admin {} deleted reference image {}",
            admin.user_id(),
            reference_id
        );
        Ok(())
    }
}

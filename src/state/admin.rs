use super::AppState;
use crate::auth::{AdminCapability, AuthError};
use crate::types::*;
use chrono::Utc;
use std::collections::BTreeMap;

/// Prefix of every organiser hint in a player's chat
pub const HINT_PREFIX: &str = "📢 Indice de l'organisateur : ";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AdminError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Storage failed: {0}")]
    Storage(String),

    #[error("No user with {0}")]
    UserNotFound(String),

    #[error("User is already an administrator")]
    AlreadyAdmin,

    #[error("Maximum {0} administrateurs autorisés")]
    AdminLimitReached(usize),

    #[error("At least one administrator must remain")]
    LastAdmin,
}

/// Who receives an organiser hint
#[derive(Debug, Clone, PartialEq)]
pub enum HintTarget {
    All,
    Team(String),
}

impl AppState {
    pub async fn is_admin(&self, user_id: &str) -> bool {
        self.user_roles
            .read()
            .await
            .iter()
            .any(|r| r.user_id == user_id && r.role == AppRole::Admin)
    }

    /// Role check for every administrative operation
    pub async fn authorize_admin(&self, user_id: &str) -> Result<AdminCapability, AuthError> {
        if self.is_admin(user_id).await {
            Ok(AdminCapability::granted(user_id.to_string()))
        } else {
            tracing::warn!("User {} attempted an admin operation", user_id);
            Err(AuthError::Forbidden(user_id.to_string()))
        }
    }

    /// Idempotent: a role already held is not duplicated
    pub(crate) async fn grant_role(&self, user_id: &str, role: AppRole) -> UserRole {
        let mut roles = self.user_roles.write().await;
        if let Some(existing) = roles
            .iter()
            .find(|r| r.user_id == user_id && r.role == role)
        {
            return existing.clone();
        }
        let granted = UserRole {
            id: ulid::Ulid::new().to_string(),
            user_id: user_id.to_string(),
            role,
            created_at: Utc::now(),
        };
        roles.push(granted.clone());
        granted
    }

    pub async fn list_admins(&self, _admin: &AdminCapability) -> Vec<AdminEntry> {
        let roles = self.user_roles.read().await;
        let profiles = self.profiles.read().await;
        roles
            .iter()
            .filter(|r| r.role == AppRole::Admin)
            .map(|r| AdminEntry {
                id: r.id.clone(),
                user_id: r.user_id.clone(),
                email: profiles
                    .get(&r.user_id)
                    .map(|p| p.email.clone())
                    .unwrap_or_default(),
                created_at: r.created_at,
            })
            .collect()
    }

    /// Promote an existing player, found by email
    pub async fn add_admin(
        &self,
        admin: &AdminCapability,
        email: &str,
    ) -> Result<AdminEntry, AdminError> {
        let profile = self
            .find_profile_by_email(email)
            .await
            .ok_or_else(|| AdminError::UserNotFound(format!("email {}", email.trim())))?;

        // Cap check and grant happen under one guard
        let mut roles = self.user_roles.write().await;
        let admins: Vec<&UserRole> = roles.iter().filter(|r| r.role == AppRole::Admin).collect();
        if admins.iter().any(|r| r.user_id == profile.id) {
            return Err(AdminError::AlreadyAdmin);
        }
        if admins.len() >= MAX_ADMINS {
            return Err(AdminError::AdminLimitReached(MAX_ADMINS));
        }

        let role = UserRole {
            id: ulid::Ulid::new().to_string(),
            user_id: profile.id.clone(),
            role: AppRole::Admin,
            created_at: Utc::now(),
        };
        roles.push(role.clone());
        drop(roles);

        tracing::info!("Admin {} promoted {}", admin.user_id(), profile.email);
        Ok(AdminEntry {
            id: role.id,
            user_id: profile.id,
            email: profile.email,
            created_at: role.created_at,
        })
    }

    pub async fn remove_admin(
        &self,
        admin: &AdminCapability,
        user_id: &str,
    ) -> Result<(), AdminError> {
        let mut roles = self.user_roles.write().await;
        let admin_count = roles.iter().filter(|r| r.role == AppRole::Admin).count();
        let position = roles
            .iter()
            .position(|r| r.user_id == user_id && r.role == AppRole::Admin)
            .ok_or_else(|| AdminError::NotFound(format!("administrator {}", user_id)))?;
        if admin_count <= 1 {
            return Err(AdminError::LastAdmin);
        }
        roles.remove(position);

        tracing::info!("Admin {} demoted {}", admin.user_id(), user_id);
        Ok(())
    }

    /// Teams with their player counts, by name
    pub async fn list_teams(&self, _admin: &AdminCapability) -> Vec<TeamSummary> {
        let mut teams: BTreeMap<String, usize> = BTreeMap::new();
        for profile in self.profiles.read().await.values() {
            if let Some(team) = &profile.team_name {
                *teams.entry(team.clone()).or_default() += 1;
            }
        }
        teams
            .into_iter()
            .map(|(team_name, player_count)| TeamSummary {
                team_name,
                player_count,
            })
            .collect()
    }

    /// Drop an organiser hint into the chat of every targeted player.
    /// Returns how many players received it.
    pub async fn send_hint(
        &self,
        admin: &AdminCapability,
        target: HintTarget,
        message: &str,
    ) -> Result<usize, AdminError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(AdminError::Invalid("hint message is empty".to_string()));
        }

        let recipients: Vec<UserId> = self
            .profiles
            .read()
            .await
            .values()
            .filter(|p| match &target {
                HintTarget::All => true,
                HintTarget::Team(team) => p.team_name.as_deref() == Some(team.as_str()),
            })
            .map(|p| p.id.clone())
            .collect();
        if let HintTarget::Team(team) = &target {
            if recipients.is_empty() {
                return Err(AdminError::NotFound(format!("team {}", team)));
            }
        }

        let now = Utc::now();
        let content = format!("{}{}", HINT_PREFIX, message);
        self.chat_messages
            .write()
            .await
            .extend(recipients.iter().map(|user_id| ChatMessageRecord {
                id: ulid::Ulid::new().to_string(),
                user_id: user_id.clone(),
                role: ChatRole::Assistant,
                content: content.clone(),
                created_at: now,
            }));

        tracing::info!(
            "Admin {} sent a hint to {} players ({:?})",
            admin.user_id(),
            recipients.len(),
            target
        );
        Ok(recipients.len())
    }
}

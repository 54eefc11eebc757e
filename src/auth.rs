//! Caller identity and the administrator capability

use crate::state::AppState;
use crate::types::UserId;
use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

/// Header carrying the authenticated user id (set by the auth proxy)
pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("Missing or empty x-user-id header")]
    MissingIdentity,

    #[error("User {0} is not an administrator")]
    Forbidden(UserId),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            AuthError::MissingIdentity => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            AuthError::Forbidden(_) => (StatusCode::FORBIDDEN, "forbidden"),
        };
        let body = serde_json::json!({ "error": code, "message": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Proof that the holder passed the admin role check. Only
/// `AppState::authorize_admin` hands these out.
#[derive(Debug, Clone)]
pub struct AdminCapability {
    user_id: UserId,
}

impl AdminCapability {
    pub(crate) fn granted(user_id: UserId) -> Self {
        Self { user_id }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

fn caller_id(parts: &Parts) -> Option<UserId> {
    parts
        .headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// The user making the request
#[derive(Debug, Clone)]
pub struct Caller(pub UserId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_id(parts).map(Caller).ok_or(AuthError::MissingIdentity)
    }
}

/// A caller holding the admin role
#[derive(Debug, Clone)]
pub struct Admin(pub AdminCapability);

impl FromRequestParts<Arc<AppState>> for Admin {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let user_id = caller_id(parts).ok_or(AuthError::MissingIdentity)?;
        state.authorize_admin(&user_id).await.map(Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::NewProfile;
    use crate::types::GameConfig;
    use axum::http::Request;

    fn parts(user: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/api/admin/teams");
        if let Some(user) = user {
            builder = builder.header(USER_HEADER, user);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_caller_requires_header() {
        let mut with = parts(Some(" 01HZX "));
        let Caller(id) = Caller::from_request_parts(&mut with, &()).await.unwrap();
        assert_eq!(id, "01HZX");

        let mut blank = parts(Some("  "));
        assert_eq!(
            Caller::from_request_parts(&mut blank, &()).await.unwrap_err(),
            AuthError::MissingIdentity
        );
        let mut without = parts(None);
        assert!(Caller::from_request_parts(&mut without, &()).await.is_err());
    }

    #[tokio::test]
    async fn test_admin_extractor_checks_role() {
        let state = Arc::new(AppState::new().with_config(GameConfig {
            bootstrap_admin_email: Some("orga@example.fr".to_string()),
            ..GameConfig::default()
        }));
        let orga = state
            .create_profile(NewProfile {
                email: "orga@example.fr".to_string(),
                team_name: None,
                language: None,
            })
            .await
            .unwrap();
        let player = state
            .create_profile(NewProfile {
                email: "a@example.fr".to_string(),
                team_name: None,
                language: None,
            })
            .await
            .unwrap();

        let mut admin_parts = parts(Some(&orga.id));
        let Admin(cap) = Admin::from_request_parts(&mut admin_parts, &state)
            .await
            .unwrap();
        assert_eq!(cap.user_id(), orga.id);

        let mut player_parts = parts(Some(&player.id));
        assert_eq!(
            Admin::from_request_parts(&mut player_parts, &state)
                .await
                .unwrap_err(),
            AuthError::Forbidden(player.id.clone())
        );
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(
            AuthError::MissingIdentity.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AuthError::Forbidden("u".to_string()).into_response().status(),
            StatusCode::FORBIDDEN
        );
    }
}

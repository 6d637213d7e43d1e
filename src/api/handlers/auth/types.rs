//! Request/response types for auth endpoints.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Auto,
    Signin,
    Signup,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SendOtpRequest {
    pub identity: String,
    pub name: Option<String>,
    #[serde(default)]
    pub mode: AuthMode,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SendOtpResponse {
    pub ok: bool,
    pub challenge_id: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct VerifyOtpRequest {
    pub identity: String,
    pub code: String,
    pub challenge_id: String,
    #[serde(default)]
    pub mode: AuthMode,
    pub name: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub role: String,
    pub display_name: Option<String>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug, Clone, Default)]
pub struct EntitlementFlags {
    pub pro_enabled: bool,
    pub wallet_deployments: bool,
    pub history_export: bool,
    pub chat_agents: bool,
    pub hosted_frontend: bool,
    pub limits: serde_json::Value,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct SessionEnvelope {
    pub ok: bool,
    pub user: UserProfile,
    pub entitlements: EntitlementFlags,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mode_defaults_to_auto() {
        let request: SendOtpRequest =
            serde_json::from_str(r#"{"identity":"a@example.com"}"#).expect("parse");
        assert_eq!(request.mode, AuthMode::Auto);
        assert!(request.name.is_none());
    }

    #[test]
    fn auth_mode_parses_lowercase() {
        let request: VerifyOtpRequest = serde_json::from_str(
            r#"{"identity":"a@example.com","code":"123456","challenge_id":"c","mode":"signup"}"#,
        )
        .expect("parse");
        assert_eq!(request.mode, AuthMode::Signup);
    }

    #[test]
    fn session_envelope_round_trips() {
        let envelope = SessionEnvelope {
            ok: true,
            user: UserProfile {
                id: "u".to_string(),
                email: "a@example.com".to_string(),
                role: "normal".to_string(),
                display_name: None,
            },
            entitlements: EntitlementFlags::default(),
        };
        let value = serde_json::to_value(&envelope).expect("serialize");
        assert_eq!(value["user"]["email"], "a@example.com");
        assert_eq!(value["entitlements"]["pro_enabled"], false);
        let decoded: SessionEnvelope = serde_json::from_value(value).expect("decode");
        assert!(decoded.ok);
    }
}

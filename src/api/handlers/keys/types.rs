//! Request/response types for premium-key endpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(ToSchema, Serialize, Deserialize, Debug, Default)]
pub struct MintKeyRequest {
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct MintKeyResponse {
    pub ok: bool,
    pub id: String,
    /// The raw key; shown exactly once, never recoverable afterwards.
    pub key: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RedeemKeyRequest {
    pub key: String,
}

#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct RevokeKeyRequest {
    pub id: uuid::Uuid,
}

/// Key row without secret material.
#[derive(ToSchema, Serialize, Deserialize, Debug)]
pub struct KeySummary {
    pub id: String,
    pub issued_by_admin: String,
    pub status: String,
    pub redeemed_by_user: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_summary_never_carries_secret_material() {
        let summary = KeySummary {
            id: "k".to_string(),
            issued_by_admin: "a".to_string(),
            status: "minted".to_string(),
            redeemed_by_user: None,
            expires_at: None,
            created_at: Utc::now(),
        };
        let value = serde_json::to_value(&summary).expect("serialize");
        assert!(value.get("secret_hash").is_none());
        assert!(value.get("lookup_hash").is_none());
    }

    #[test]
    fn mint_request_expiry_is_optional() {
        let request: MintKeyRequest = serde_json::from_str("{}").expect("parse");
        assert!(request.expires_at.is_none());
    }
}

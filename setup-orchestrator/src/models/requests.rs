// Request payloads sent to the setup services

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallOptions {
    #[serde(default)]
    pub force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedValidationRequest {
    pub provider: String,
    /// Field values entered by the user. Contains the secret; never log this struct.
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicValidationRequest {
    pub providers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetSecretRequest {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveProgressRequest {
    pub step: u32,
    /// A `PersistedSnapshot` without credentials.
    pub state: Value,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteWizardRequest {
    pub final_step: u32,
    pub final_state: Value,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetWizardRequest {
    pub preserve_data: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_options_omit_unset_fields() {
        let json = serde_json::to_string(&InstallOptions::default()).unwrap();
        assert_eq!(json, r#"{"force":false}"#);
    }

    #[test]
    fn save_progress_uses_camel_case() {
        let req = SaveProgressRequest {
            step: 2,
            state: serde_json::json!({"step": 2}),
            correlation_id: "c0ffee".to_string(),
            user_id: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(
            json.contains("\"correlationId\""),
            "Should use camelCase: {}",
            json
        );
        assert!(!json.contains("userId"), "Should skip empty user id: {}", json);
    }
}

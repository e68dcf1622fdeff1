use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::app::{GenerationParams, RequestId, TokenEvent};
use crate::core::{HandleId, LoadConfig};
use crate::error::CoreError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LoadModelArgs {
    pub model_path: String,
    #[serde(default)]
    pub config: LoadConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GenerateArgs {
    pub handle_id: HandleId,
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CancelArgs {
    pub request_id: RequestId,
}

/// Payload of `unloadModel` and `isModelReady`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HandleArgs {
    pub handle_id: HandleId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DownloadArgs {
    pub model_url: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Payload of `identifyObject`. `prompt` defaults to the plant and
/// mushroom question.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IdentifyArgs {
    pub handle_id: HandleId,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub observations: Option<String>,
    #[serde(default)]
    pub params: GenerationParams,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NoArgs {}

/// A token event as the host sees it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload<'a> {
    #[serde(flatten)]
    pub event: &'a TokenEvent,
    pub created_at: String,
}

impl<'a> TokenPayload<'a> {
    pub fn new(event: &'a TokenEvent) -> Self {
        Self {
            event,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

pub fn error_payload(err: &CoreError) -> Value {
    json!({
        "code": err.code(),
        "message": err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::FinishReason;

    #[test]
    fn test_load_args_defaults_config() {
        let args: LoadModelArgs = serde_json::from_value(json!({"modelPath": "model.bin"})).unwrap();
        assert_eq!(args.config, LoadConfig::default());

        let args: LoadModelArgs =
            serde_json::from_value(json!({"modelPath": "m.gguf", "config": {"contextLength": 512, "seed": 3}})).unwrap();
        assert_eq!(args.config.context_length, 512);
        assert_eq!(args.config.seed, Some(3));
    }

    #[test]
    fn test_unknown_fields_are_refused() {
        assert!(serde_json::from_value::<HandleArgs>(json!({"handleId": 1, "force": true})).is_err());
        assert!(serde_json::from_value::<LoadModelArgs>(json!({"modelPath": "m", "config": {"gpu": true}})).is_err());
        assert!(serde_json::from_value::<NoArgs>(json!({"x": 1})).is_err());
    }

    #[test]
    fn test_token_payload_shape() {
        let event = TokenEvent {
            request_id: 4,
            seq: 2,
            fragment: String::new(),
            is_final: true,
            finish_reason: Some(FinishReason::Cancelled),
            error: None,
        };
        let value = serde_json::to_value(TokenPayload::new(&event)).unwrap();
        assert_eq!(value["requestId"], 4);
        assert_eq!(value["isFinal"], true);
        assert_eq!(value["finishReason"], "cancelled");
        assert!(value["createdAt"].as_str().is_some());
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_error_payload() {
        let value = error_payload(&CoreError::Overload { capacity: 2 });
        assert_eq!(value["code"], "OVERLOAD_ERROR");
        assert!(value["message"].as_str().unwrap().contains('2'));
    }
}

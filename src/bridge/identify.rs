//! Text-side object identification: a fixed JSON answer template around the
//! host's prompt, and a lenient reader for what the model writes back.

use serde::Serialize;
use serde_json::Value;

pub const DEFAULT_PROMPT: &str = "Identify this plant or mushroom. Provide the common name, scientific name, \
edibility status (toxic/not-edible/edible), description, habitat, key features, and any safety warnings.";

const ANSWER_TEMPLATE: &str = r#"Please analyze the subject and provide the following information in JSON format:
{
    "commonName": "string",
    "scientificName": "string",
    "confidence": number (0-100),
    "edibility": "toxic" | "not-edible" | "edible",
    "description": "string",
    "habitat": "string",
    "features": ["string array"],
    "warnings": ["string array"],
    "guideId": "string"
}"#;

const GUIDANCE: &str = "Focus on identifying plants, mushrooms, or other natural objects. \
Be accurate about edibility and provide safety warnings when appropriate.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Edibility {
    Toxic,
    NotEdible,
    Edible,
}

impl Edibility {
    /// Anything unrecognized reads as `not-edible`.
    fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "toxic" => Edibility::Toxic,
            "edible" => Edibility::Edible,
            _ => Edibility::NotEdible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub common_name: String,
    pub scientific_name: String,
    pub confidence: u8,
    pub edibility: Edibility,
    pub description: String,
    pub habitat: String,
    pub features: Vec<String>,
    pub warnings: Vec<String>,
    pub guide_id: String,
}

impl Identification {
    /// What the host gets when the model's answer holds no usable JSON. The
    /// raw answer is kept as the description.
    pub fn fallback(response: &str) -> Self {
        Self {
            common_name: "Unknown Species".to_string(),
            scientific_name: "Species unknown".to_string(),
            confidence: 30,
            edibility: Edibility::NotEdible,
            description: response.to_string(),
            habitat: "Unknown".to_string(),
            features: vec!["Analysis incomplete".to_string()],
            warnings: vec!["Unable to determine safety - do not consume".to_string()],
            guide_id: String::new(),
        }
    }

    /// Reads the outermost `{...}` span of `response`. Missing fields take
    /// defaults; a span that is not a JSON object yields the fallback.
    pub fn parse(response: &str) -> Self {
        let span = match (response.find('{'), response.rfind('}')) {
            (Some(start), Some(end)) if end > start => &response[start..=end],
            _ => return Self::fallback(response),
        };
        let object = match serde_json::from_str::<Value>(span) {
            Ok(Value::Object(object)) => object,
            Ok(_) => return Self::fallback(response),
            Err(e) => {
                tracing::debug!("Identification answer is not valid JSON: {}", e);
                return Self::fallback(response);
            }
        };

        let text = |key: &str, default: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(default)
                .to_string()
        };
        let list = |key: &str| -> Vec<String> {
            object
                .get(key)
                .and_then(Value::as_array)
                .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
                .unwrap_or_default()
        };

        Self {
            common_name: text("commonName", "Unknown"),
            scientific_name: text("scientificName", "Unknown"),
            confidence: object
                .get("confidence")
                .and_then(Value::as_f64)
                .map(|c| c.clamp(0.0, 100.0).round() as u8)
                .unwrap_or(50),
            edibility: object
                .get("edibility")
                .and_then(Value::as_str)
                .map(Edibility::parse)
                .unwrap_or(Edibility::NotEdible),
            description: text("description", response),
            habitat: text("habitat", ""),
            features: list("features"),
            warnings: list("warnings"),
            guide_id: text("guideId", ""),
        }
    }
}

/// Wraps the host's prompt with the answer template. `observations` is
/// free text describing the subject, when the host has any.
pub fn build_prompt(prompt: &str, observations: Option<&str>) -> String {
    let mut out = format!("{}\n\n{}\n", prompt.trim(), ANSWER_TEMPLATE);
    if let Some(observations) = observations.map(str::trim).filter(|o| !o.is_empty()) {
        out.push_str(&format!("\nObservations: {}\n", observations));
    }
    out.push('\n');
    out.push_str(GUIDANCE);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_carries_template_and_observations() {
        let prompt = build_prompt("What is this?", Some("red cap, white spots"));
        assert!(prompt.starts_with("What is this?\n"));
        assert!(prompt.contains("\"edibility\": \"toxic\" | \"not-edible\" | \"edible\""));
        assert!(prompt.contains("Observations: red cap, white spots"));
        assert!(prompt.ends_with(GUIDANCE));

        assert!(!build_prompt("What is this?", Some("  ")).contains("Observations"));
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let answer = r#"Sure! Here it is: {"commonName": "Fly agaric", "scientificName": "Amanita muscaria",
            "confidence": 87.6, "edibility": "toxic", "description": "A red mushroom.",
            "features": ["red cap", "white spots"], "warnings": ["Poisonous"]} Stay safe."#;
        let id = Identification::parse(answer);

        assert_eq!(id.common_name, "Fly agaric");
        assert_eq!(id.scientific_name, "Amanita muscaria");
        assert_eq!(id.confidence, 88);
        assert_eq!(id.edibility, Edibility::Toxic);
        assert_eq!(id.features, vec!["red cap", "white spots"]);
        assert_eq!(id.warnings, vec!["Poisonous"]);
        assert_eq!(id.habitat, "");
        assert_eq!(id.guide_id, "");
    }

    #[test]
    fn test_parse_fills_missing_fields() {
        let id = Identification::parse(r#"{"edibility": "maybe"}"#);
        assert_eq!(id.common_name, "Unknown");
        assert_eq!(id.confidence, 50);
        assert_eq!(id.edibility, Edibility::NotEdible);
        assert_eq!(id.description, r#"{"edibility": "maybe"}"#);
        assert!(id.features.is_empty());
    }

    #[test]
    fn test_unusable_answers_fall_back() {
        for answer in ["I cannot tell.", "} backwards {", "{not json at all}", "[{}] {1}"] {
            let id = Identification::parse(answer);
            assert_eq!(id, Identification::fallback(answer), "{}", answer);
        }
        let fallback = Identification::fallback("no idea");
        assert_eq!(fallback.confidence, 30);
        assert_eq!(fallback.description, "no idea");
        assert_eq!(fallback.warnings, vec!["Unable to determine safety - do not consume"]);
    }

    #[test]
    fn test_serializes_with_host_field_names() {
        let value = serde_json::to_value(Identification::fallback("x")).unwrap();
        assert_eq!(value["commonName"], "Unknown Species");
        assert_eq!(value["edibility"], "not-edible");
        assert_eq!(value["guideId"], "");
    }
}

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Server-generated identifier correlating a command with its context
/// round trip, its script and any execution error reported for it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How captured audio becomes a command for the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TranscriptionMethod {
    /// Audio goes to the generative model untouched.
    #[serde(rename = "gemini")]
    DirectAudio,
    /// Local Whisper model.
    #[serde(rename = "whisper")]
    Whisper,
    /// Google Cloud Speech-to-Text.
    #[serde(rename = "google_stt")]
    GoogleStt,
}

impl TranscriptionMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptionMethod::DirectAudio => "gemini",
            TranscriptionMethod::Whisper => "whisper",
            TranscriptionMethod::GoogleStt => "google_stt",
        }
    }

    /// Human readable name used in status narration.
    pub fn label(&self) -> &'static str {
        match self {
            TranscriptionMethod::DirectAudio => "Gemini",
            TranscriptionMethod::Whisper => "Whisper",
            TranscriptionMethod::GoogleStt => "Google STT",
        }
    }
}

impl fmt::Display for TranscriptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-connection selection made by a `configure` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub model: String,
    pub method: TranscriptionMethod,
}

/// Scene snapshot supplied by the host application.
///
/// The server never interprets it beyond rendering it into prompt text, so it
/// is kept as raw JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SceneContext(pub Value);

impl SceneContext {
    pub fn empty() -> Self {
        Self(Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        match &self.0 {
            Value::Null => true,
            Value::Object(map) => map.is_empty(),
            _ => false,
        }
    }

    /// Render the snapshot as the plain-text block embedded in prompts.
    pub fn describe(&self) -> String {
        if self.is_empty() {
            return "No Blender context provided.".to_string();
        }

        let mut lines = Vec::new();
        lines.push(format!("Scene: {}", self.text_field(&self.0, "scene_name", "N/A")));
        lines.push(format!("Mode: {}", self.text_field(&self.0, "mode", "UNKNOWN")));

        match self.0.get("active_object").filter(|v| !v.is_null()) {
            Some(active) => lines.push(format!(
                "Active Object: {} (Type: {}, Loc: {}, Rot: {}, Scale: {})",
                self.text_field(active, "name", "N/A"),
                self.text_field(active, "type", "N/A"),
                self.text_field(active, "location", "None"),
                self.text_field(active, "rotation_euler", "None"),
                self.text_field(active, "scale", "None"),
            )),
            None => lines.push("Active Object: None".to_string()),
        }

        let selected: Vec<String> = self
            .list_field("selected_objects")
            .iter()
            .map(|obj| {
                format!(
                    "{} ({})",
                    self.text_field(obj, "name", "N/A"),
                    self.text_field(obj, "type", "N/A")
                )
            })
            .collect();
        lines.push(format!("Selected Objects: [{}]", selected.join(", ")));

        let others: Vec<String> = self
            .list_field("scene_objects")
            .iter()
            .map(|obj| match obj {
                Value::String(name) => name.clone(),
                other => self.text_field(other, "name", "N/A"),
            })
            .collect();
        lines.push(format!("Other Scene Objects: [{}]", others.join(", ")));

        lines.join("\n")
    }

    fn text_field(&self, value: &Value, key: &str, default: &str) -> String {
        match value.get(key) {
            None | Some(Value::Null) => default.to_string(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }

    fn list_field(&self, key: &str) -> Vec<Value> {
        self.0
            .get(key)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_context_has_placeholder_text() {
        assert_eq!(SceneContext::empty().describe(), "No Blender context provided.");
        assert_eq!(SceneContext(json!({})).describe(), "No Blender context provided.");
    }

    #[test]
    fn describes_active_selected_and_other_objects() {
        let context = SceneContext(json!({
            "scene_name": "MyScene",
            "mode": "OBJECT",
            "active_object": {
                "name": "Cube",
                "type": "MESH",
                "location": "(1, 2, 3)",
                "rotation_euler": "(0, 0, 0)",
                "scale": "(1, 1, 1)"
            },
            "selected_objects": [
                {"name": "Cube", "type": "MESH"},
                {"name": "Light", "type": "LIGHT"}
            ],
            "scene_objects": ["Camera", "Lamp"]
        }));

        let expected = "Scene: MyScene\n\
                        Mode: OBJECT\n\
                        Active Object: Cube (Type: MESH, Loc: (1, 2, 3), Rot: (0, 0, 0), Scale: (1, 1, 1))\n\
                        Selected Objects: [Cube (MESH), Light (LIGHT)]\n\
                        Other Scene Objects: [Camera, Lamp]";
        assert_eq!(context.describe(), expected);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let context = SceneContext(json!({"mode": "EDIT"}));
        assert_eq!(
            context.describe(),
            "Scene: N/A\nMode: EDIT\nActive Object: None\nSelected Objects: []\nOther Scene Objects: []"
        );
    }

    #[test]
    fn method_uses_wire_names() {
        let method: TranscriptionMethod = serde_json::from_str("\"google_stt\"").unwrap();
        assert_eq!(method, TranscriptionMethod::GoogleStt);
        assert_eq!(
            serde_json::to_string(&TranscriptionMethod::DirectAudio).unwrap(),
            "\"gemini\""
        );
    }

    #[test]
    fn generated_request_ids_are_distinct() {
        assert_ne!(RequestId::generate(), RequestId::generate());
    }
}

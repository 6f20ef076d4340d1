//! Reading the loosely shaped request payloads the front door passes along.

use serde::Serialize;
use serde_json::Value;

use crate::model_spec::ModelSpec;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;
pub const DEFAULT_TOP_P: f32 = 0.9;

/// Speech language codes understood by the speech worker.
pub const LANG_ENGLISH: &str = "a";
pub const LANG_FRENCH: &str = "f";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Turn a responses-style payload into chat messages.
///
/// Accepts `messages`, `input` as a string or a list of strings / text
/// parts / entries carrying a `content` list, and `prompt`, in that order.
pub fn chat_messages(payload: &Value) -> Vec<ChatMessage> {
    if let Some(messages) = payload.get("messages").and_then(Value::as_array) {
        let parsed: Vec<ChatMessage> = messages
            .iter()
            .map(|m| ChatMessage {
                role: m.get("role").and_then(Value::as_str).unwrap_or("user").to_string(),
                content: content_text(m.get("content")),
            })
            .collect();
        if !parsed.is_empty() {
            return parsed;
        }
    }
    let prompt = prompt_text(payload);
    vec![ChatMessage {
        role: "user".to_string(),
        content: prompt,
    }]
}

/// Flatten the prompt of a responses payload into one string.
pub fn prompt_text(payload: &Value) -> String {
    match payload.get("input") {
        Some(Value::String(text)) => return text.clone(),
        Some(Value::Array(entries)) => {
            let mut fragments = Vec::new();
            for entry in entries {
                match entry {
                    Value::String(text) => fragments.push(text.clone()),
                    Value::Object(_) => {
                        let kind = entry.get("type").and_then(Value::as_str);
                        match (kind, entry.get("text")) {
                            (Some("text" | "input_text"), Some(text)) => fragments.push(value_string(text)),
                            _ => {
                                if let Some(parts) = entry.get("content").and_then(Value::as_array) {
                                    fragments.extend(
                                        parts
                                            .iter()
                                            .filter_map(|p| p.get("text"))
                                            .map(value_string),
                                    );
                                }
                            }
                        }
                    }
                    _ => {}
                }
            }
            if !fragments.is_empty() {
                return fragments.join("\n");
            }
        }
        _ => {}
    }
    match payload.get("prompt") {
        Some(Value::String(prompt)) if !prompt.is_empty() => prompt.clone(),
        _ => DEFAULT_SYSTEM_PROMPT.to_string(),
    }
}

/// Text to synthesise: the first text found, or empty when there is none.
pub fn speech_text(payload: &Value) -> String {
    match payload.get("input") {
        Some(Value::String(text)) => return text.clone(),
        Some(Value::Array(entries)) => {
            for entry in entries {
                if let Value::String(text) = entry {
                    return text.clone();
                }
                if entry.get("type").and_then(Value::as_str) == Some("input_text") {
                    if let Some(text) = entry.get("text") {
                        return value_string(text);
                    }
                }
                if let Some(parts) = entry.get("content").and_then(Value::as_array) {
                    let first = parts
                        .iter()
                        .find(|p| p.get("type").and_then(Value::as_str) == Some("input_text"));
                    if let Some(part) = first {
                        return part.get("text").map(value_string).unwrap_or_default();
                    }
                }
            }
        }
        _ => {}
    }
    payload
        .get("text")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text"))
            .map(value_string)
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn value_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl GenerationParams {
    /// Missing, zero or malformed values fall back to the defaults.
    pub fn from_payload(payload: &Value, spec: &ModelSpec) -> Self {
        let max_tokens = payload
            .get("max_output_tokens")
            .and_then(Value::as_u64)
            .filter(|v| *v > 0)
            .map(|v| v.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(spec.limits.max_output_tokens_default);
        let float = |key: &str, default: f32| {
            payload
                .get(key)
                .and_then(Value::as_f64)
                .filter(|v| *v != 0.0)
                .map(|v| v as f32)
                .unwrap_or(default)
        };
        Self {
            max_tokens,
            temperature: float("temperature", DEFAULT_TEMPERATURE),
            top_p: float("top_p", DEFAULT_TOP_P),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceSelection {
    pub lang_code: &'static str,
    pub voice: String,
}

/// Map `language`/`lang`/`voice_language` to a language code, and pick the
/// requested voice or that language's default.
pub fn resolve_voice(payload: &Value) -> VoiceSelection {
    let language = ["language", "lang", "voice_language"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str).filter(|s| !s.is_empty()));
    let lang_code = match language.map(|l| l.trim().to_lowercase()).as_deref() {
        Some("f" | "fr" | "french") => LANG_FRENCH,
        _ => LANG_ENGLISH,
    };
    let voice = payload
        .get("voice")
        .and_then(Value::as_str)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| default_voice(lang_code).to_string());
    VoiceSelection { lang_code, voice }
}

pub fn default_voice(lang_code: &str) -> &'static str {
    match lang_code {
        LANG_FRENCH => "ff_siwis",
        _ => "af_bella",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_spec::ModelKind;
    use serde_json::json;

    #[test]
    fn test_prompt_text_shapes() {
        assert_eq!(prompt_text(&json!({"input": "Hello"})), "Hello");
        assert_eq!(prompt_text(&json!({"input": ["a", "b"]})), "a\nb");
        assert_eq!(
            prompt_text(&json!({"input": [{"type": "input_text", "text": "hi"}]})),
            "hi"
        );
        assert_eq!(
            prompt_text(&json!({"input": [{"role": "user", "content": [{"type": "input_text", "text": "x"}, {"text": "y"}]}]})),
            "x\ny"
        );
        assert_eq!(prompt_text(&json!({"prompt": "p"})), "p");
        assert_eq!(prompt_text(&json!({})), DEFAULT_SYSTEM_PROMPT);
    }

    #[test]
    fn test_chat_messages_prefers_messages() {
        let messages = chat_messages(&json!({
            "messages": [{"role": "system", "content": "be brief"}, {"content": "hi"}],
            "input": "ignored"
        }));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "user");

        let messages = chat_messages(&json!({"input": "Hello"}));
        assert_eq!(messages, vec![ChatMessage { role: "user".into(), content: "Hello".into() }]);
    }

    #[test]
    fn test_speech_text_takes_first_text() {
        assert_eq!(speech_text(&json!({"input": "Bonjour"})), "Bonjour");
        assert_eq!(speech_text(&json!({"input": ["one", "two"]})), "one");
        assert_eq!(
            speech_text(&json!({"input": [{"content": [{"type": "input_text", "text": "inner"}]}]})),
            "inner"
        );
        assert_eq!(speech_text(&json!({"text": "plain"})), "plain");
        assert_eq!(speech_text(&json!({"input": 3})), "");
    }

    #[test]
    fn test_generation_params_defaults() {
        let spec = ModelSpec::new("m", ModelKind::Llm);
        let params = GenerationParams::from_payload(&json!({}), &spec);
        assert_eq!(params.max_tokens, 2048);
        assert_eq!(params.temperature, DEFAULT_TEMPERATURE);

        let params = GenerationParams::from_payload(
            &json!({"max_output_tokens": 16, "temperature": 0.2, "top_p": 0}),
            &spec,
        );
        assert_eq!(params.max_tokens, 16);
        assert!((params.temperature - 0.2).abs() < f32::EPSILON);
        assert_eq!(params.top_p, DEFAULT_TOP_P);
    }

    #[test]
    fn test_voice_resolution() {
        assert_eq!(
            resolve_voice(&json!({})),
            VoiceSelection { lang_code: "a", voice: "af_bella".into() }
        );
        assert_eq!(resolve_voice(&json!({"lang": "French"})).voice, "ff_siwis");
        assert_eq!(resolve_voice(&json!({"voice_language": "fr", "voice": "custom"})).voice, "custom");
        assert_eq!(resolve_voice(&json!({"language": "klingon"})).lang_code, "a");
    }
}

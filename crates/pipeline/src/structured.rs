//! Strict parsing of structured completion output
//!
//! Model output is parsed into a fixed schema and validated before anything
//! downstream sees it. A parse or validation failure is a value, not an
//! error, so callers can decide on a corrective re-prompt.

use serde::de::DeserializeOwned;

/// Semantic checks a payload must pass after deserialization
pub trait Validate {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum StructuredOutput<T> {
    Parsed(T),
    Malformed { raw: String, reason: String },
}

impl<T: DeserializeOwned + Validate> StructuredOutput<T> {
    pub fn parse(raw: &str) -> Self {
        let malformed = |reason: String| StructuredOutput::Malformed {
            raw: raw.to_string(),
            reason,
        };
        if raw.trim().is_empty() {
            return malformed("empty output".to_string());
        }
        let Some(body) = object_span(raw) else {
            return malformed("no JSON object in output".to_string());
        };
        match serde_json::from_str::<T>(body) {
            Ok(value) => match value.validate() {
                Ok(()) => StructuredOutput::Parsed(value),
                Err(reason) => malformed(reason),
            },
            Err(e) => malformed(e.to_string()),
        }
    }
}

/// The outermost `{...}` of `raw`; fences and chatter around it fall away
fn object_span(raw: &str) -> Option<&str> {
    let open = raw.find('{')?;
    let close = raw.rfind('}')?;
    (open < close).then(|| &raw[open..=close])
}

/// Follow-up prompt asking the model to fix its previous answer
pub fn corrective_prompt(original: &str, raw: &str, reason: &str) -> String {
    format!(
        "{original}\n\nYour previous reply could not be used ({reason}).\nPrevious reply:\n{raw}\n\nReply again with ONLY a valid JSON object matching the schema. No markdown, no extra text."
    )
}

//! Rich text fields. Older records carry a bare string; current ones carry a list of typed
//! inline elements. Both normalize into `RichText`.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TextSegment {
    Text { text: String },
    Mention { did: String, text: String },
    Link { uri: String, text: String },
    Tag { tag: String },
}

impl TextSegment {
    fn push_plain(&self, out: &mut String) {
        match self {
            TextSegment::Text { text } => out.push_str(text),
            TextSegment::Mention { text, .. } => out.push_str(text),
            TextSegment::Link { text, .. } => out.push_str(text),
            TextSegment::Tag { tag } => {
                out.push('#');
                out.push_str(tag);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RichText {
    pub segments: Vec<TextSegment>,
}

/// Which form a rich text field arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextSource {
    Bare,
    Elements,
}

impl RichText {
    pub fn plain(text: &str) -> Self {
        Self {
            segments: vec![TextSegment::Text {
                text: text.to_owned(),
            }],
        }
    }

    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            segment.push_plain(&mut out);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Parse either form. Elements of a kind we do not know are skipped, so records written
    /// against a newer schema still index with whatever we do understand. The error string
    /// describes what was wrong with the value.
    pub fn from_value(value: &Value) -> Result<(RichText, TextSource), String> {
        match value {
            Value::String(text) => Ok((RichText::plain(text), TextSource::Bare)),
            Value::Array(elements) => {
                let mut segments = Vec::with_capacity(elements.len());
                for (index, element) in elements.iter().enumerate() {
                    let Value::Object(element) = element else {
                        return Err(format!("element {index} is not an object"));
                    };
                    if let Some(segment) = parse_element(element)
                        .map_err(|reason| format!("element {index}: {reason}"))?
                    {
                        segments.push(segment);
                    }
                }
                Ok((RichText { segments }, TextSource::Elements))
            }
            other => Err(format!("expected a string or a list, got {}", type_name(other))),
        }
    }
}

fn parse_element(element: &Map<String, Value>) -> Result<Option<TextSegment>, String> {
    let kind = match element.get("$type").and_then(Value::as_str) {
        // `pub.example.richtext#mention` and plain `mention` name the same thing.
        Some(kind) => kind.rsplit('#').next().unwrap_or(kind),
        None if element.contains_key("$type") => return Err("$type must be a string".to_owned()),
        None => "text",
    };

    let segment = match kind {
        "text" => TextSegment::Text {
            text: required_str(element, "text")?,
        },
        "mention" => {
            let did = required_str(element, "did")?;
            TextSegment::Mention {
                text: optional_str(element, "text").unwrap_or_else(|| did.clone()),
                did,
            }
        }
        "link" => {
            let uri = required_str(element, "uri")?;
            TextSegment::Link {
                text: optional_str(element, "text").unwrap_or_else(|| uri.clone()),
                uri,
            }
        }
        "tag" => TextSegment::Tag {
            tag: required_str(element, "tag")?
                .trim_start_matches('#')
                .to_owned(),
        },
        _ => return Ok(None),
    };

    Ok(Some(segment))
}

fn required_str(element: &Map<String, Value>, key: &str) -> Result<String, String> {
    optional_str(element, key).ok_or_else(|| format!("missing string field {key}"))
}

fn optional_str(element: &Map<String, Value>, key: &str) -> Option<String> {
    element.get(key).and_then(Value::as_str).map(str::to_owned)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

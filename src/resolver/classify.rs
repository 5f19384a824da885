//! Classification of raw module payloads into stream descriptors.
//!
//! Accepted shapes:
//!
//! | Payload | Result |
//! |---------|--------|
//! | `{streams: [{url, headers?}]}` | variants with per-stream headers |
//! | `{stream: {url, headers?}}` | one variant with headers |
//! | `{streams: [string]}` | variants without headers |
//! | `{stream: string}` | one variant |
//! | `"url"` | one variant, no headers |
//! | `[string \| object]` | same as `streams` |
//!
//! `subtitles` (a string or list of strings) becomes subtitle tracks.
//! Strings holding JSON are decoded first.

use serde_json::{Map, Value};
use tracing::trace;

use super::error::ClassificationError;
use super::{PayloadKind, StreamResolutionResult, StreamVariant, SubtitleTrack};
use crate::download::RequestHeaders;

/// String form of a future that was returned without being awaited.
pub const UNRESOLVED_FUTURE_PLACEHOLDER: &str = "[object Promise]";

/// Classifies a module payload.
///
/// An object with an empty `streams` list is a valid, empty result.
///
/// # Errors
///
/// Returns [`ClassificationError`] for empty, unresolved, or malformed payloads.
pub fn classify_payload(payload: &Value) -> Result<StreamResolutionResult, ClassificationError> {
    let decoded = decode_payload(payload)?;
    match &decoded {
        Value::String(url) => Ok(StreamResolutionResult {
            variants: vec![StreamVariant::new(normalize_url(url))],
            subtitles: Vec::new(),
            payload_kind: PayloadKind::SingleString,
        }),
        Value::Array(items) => Ok(StreamResolutionResult {
            variants: variants_from_list(items),
            subtitles: Vec::new(),
            payload_kind: PayloadKind::Array,
        }),
        Value::Object(map) => classify_object(map),
        other => Err(ClassificationError::malformed(format!(
            "expected a string, list, or object, got {}",
            type_name(other)
        ))),
    }
}

/// Unwraps JSON-encoded strings and rejects empty or unresolved payloads.
///
/// # Errors
///
/// Returns [`ClassificationError::EmptyPayload`] or
/// [`ClassificationError::UnresolvedFuture`].
pub fn decode_payload(payload: &Value) -> Result<Value, ClassificationError> {
    match payload {
        Value::Null => Err(ClassificationError::EmptyPayload),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(ClassificationError::EmptyPayload);
            }
            if trimmed.contains(UNRESOLVED_FUTURE_PLACEHOLDER) {
                return Err(ClassificationError::UnresolvedFuture {
                    placeholder: UNRESOLVED_FUTURE_PLACEHOLDER.to_string(),
                });
            }
            if trimmed.starts_with('{') || trimmed.starts_with('[') || trimmed.starts_with('"') {
                let inner: Value = serde_json::from_str(trimmed)
                    .map_err(|e| ClassificationError::malformed(format!("invalid JSON: {e}")))?;
                trace!("decoded JSON string payload");
                // One level of nesting covers modules that stringify twice.
                return match inner {
                    Value::String(_) => decode_payload(&inner),
                    other => Ok(other),
                };
            }
            Ok(Value::String(trimmed.to_string()))
        }
        other => Ok(other.clone()),
    }
}

fn classify_object(map: &Map<String, Value>) -> Result<StreamResolutionResult, ClassificationError> {
    let subtitles = subtitles_from(map.get("subtitles"));

    let variants = match (map.get("streams"), map.get("stream")) {
        (Some(Value::Array(items)), _) => variants_from_list(items),
        (Some(Value::String(single)), _) | (None | Some(Value::Null), Some(Value::String(single))) => {
            variant_from_string(single).into_iter().collect()
        }
        (None | Some(Value::Null), Some(Value::Object(stream))) => {
            variant_from_object(stream).into_iter().collect()
        }
        (None | Some(Value::Null), None | Some(Value::Null)) if map.contains_key("url") => {
            variant_from_object(map).into_iter().collect()
        }
        (None | Some(Value::Null), None | Some(Value::Null)) => {
            if subtitles.is_empty() {
                return Err(ClassificationError::malformed(
                    "object has neither 'streams' nor 'stream'",
                ));
            }
            Vec::new()
        }
        (Some(other), _) | (_, Some(other)) => {
            return Err(ClassificationError::malformed(format!(
                "unexpected stream field of type {}",
                type_name(other)
            )));
        }
    };

    Ok(StreamResolutionResult {
        variants,
        subtitles,
        payload_kind: PayloadKind::Object,
    })
}

/// Builds variants from a `streams` list.
///
/// Object entries carry their own headers. String entries are kept only
/// when they look like URLs, which drops the labels of `["label", "url", ...]`
/// lists.
fn variants_from_list(items: &[Value]) -> Vec<StreamVariant> {
    items
        .iter()
        .filter_map(|item| match item {
            Value::String(s) => variant_from_string(s),
            Value::Object(obj) => variant_from_object(obj),
            _ => None,
        })
        .collect()
}

fn variant_from_string(value: &str) -> Option<StreamVariant> {
    let value = value.trim();
    looks_like_url(value).then(|| StreamVariant::new(normalize_url(value)))
}

fn variant_from_object(obj: &Map<String, Value>) -> Option<StreamVariant> {
    let url = ["url", "streamUrl", "file", "src"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::trim)
        .filter(|url| !url.is_empty())?;

    let headers = obj
        .get("headers")
        .and_then(Value::as_object)
        .map(headers_from)
        .unwrap_or_default();
    let title = ["title", "label", "quality"]
        .iter()
        .find_map(|key| obj.get(*key).and_then(Value::as_str))
        .map(str::to_string);

    Some(StreamVariant {
        url: normalize_url(url),
        headers,
        title,
    })
}

fn headers_from(map: &Map<String, Value>) -> RequestHeaders {
    map.iter()
        .filter_map(|(name, value)| {
            let value = match value {
                Value::String(s) => s.clone(),
                Value::Null => return None,
                other => other.to_string(),
            };
            Some((name.clone(), value))
        })
        .collect()
}

fn subtitles_from(value: Option<&Value>) -> Vec<SubtitleTrack> {
    let urls: Vec<&str> = match value {
        Some(Value::String(s)) => vec![s.as_str()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.as_str()),
                Value::Object(obj) => obj.get("url").and_then(Value::as_str),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };
    urls.into_iter()
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(|url| SubtitleTrack {
            url: normalize_url(url),
        })
        .collect()
}

fn looks_like_url(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("//")
}

/// Protocol-relative URLs are assumed to be https.
fn normalize_url(url: &str) -> String {
    let url = url.trim();
    if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

//! Typed catalogue entries returned by a module's search, details, and
//! episode-list entrypoints.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::resolver::{ClassificationError, decode_payload};

/// One search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchItem {
    pub title: String,
    #[serde(default, alias = "image", alias = "imageUrl", alias = "imageURL")]
    pub image_url: String,
    pub href: String,
}

/// Descriptive details of a title.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDetails {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub aliases: String,
    #[serde(default, alias = "airDate")]
    pub airdate: String,
}

/// One episode of a title.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeLink {
    #[serde(deserialize_with = "number_or_string")]
    pub number: f64,
    pub href: String,
}

impl EpisodeLink {
    /// Episode number as an integer when it has no fractional part.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn whole_number(&self) -> Option<u32> {
        (self.number.fract() == 0.0 && self.number >= 0.0 && self.number <= f64::from(u32::MAX))
            .then(|| self.number as u32)
    }
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid episode number '{text}'"))),
    }
}

/// Parses a search payload.
///
/// # Errors
///
/// Returns [`ClassificationError`] if the payload is not a list of search items.
pub fn parse_search_results(payload: &Value) -> Result<Vec<SearchItem>, ClassificationError> {
    parse_list(payload, "search results")
}

/// Parses a details payload; a single object is accepted as a one-item list.
///
/// # Errors
///
/// Returns [`ClassificationError`] if the payload is not a details object or list.
pub fn parse_details(payload: &Value) -> Result<Vec<MediaDetails>, ClassificationError> {
    parse_list(payload, "details")
}

/// Parses an episode list, ordered by episode number.
///
/// # Errors
///
/// Returns [`ClassificationError`] if the payload is not a list of episodes.
pub fn parse_episodes(payload: &Value) -> Result<Vec<EpisodeLink>, ClassificationError> {
    let mut episodes: Vec<EpisodeLink> = parse_list(payload, "episodes")?;
    episodes.sort_by(|a, b| a.number.total_cmp(&b.number));
    Ok(episodes)
}

fn parse_list<T>(payload: &Value, what: &str) -> Result<Vec<T>, ClassificationError>
where
    T: for<'de> Deserialize<'de>,
{
    let decoded = match decode_payload(payload) {
        Err(ClassificationError::EmptyPayload) => return Ok(Vec::new()),
        other => other?,
    };
    let items = match decoded {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => {
            return Err(ClassificationError::malformed(format!(
                "{what} must be a list, got {other}"
            )));
        }
    };
    items
        .into_iter()
        .map(|item| {
            serde_json::from_value(item)
                .map_err(|e| ClassificationError::malformed(format!("invalid {what} entry: {e}")))
        })
        .collect()
}

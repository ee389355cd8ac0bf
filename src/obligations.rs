//! Obligations extracted from a contract, and the follow-up questions a
//! reader can ask about each of them.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{EnumIter, EnumString};

use crate::error::{Error, Result};

const JSON_FENCE: &str = "```json";
const FENCE: &str = "```";

/// One party's duty under the contract
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Obligation {
    #[serde(deserialize_with = "lenient_text")]
    pub entity_name: String,
    #[serde(deserialize_with = "lenient_text")]
    pub obligation_type: String,
    #[serde(deserialize_with = "lenient_text")]
    pub description: String,
    #[serde(deserialize_with = "lenient_text")]
    pub penalties: String,
    #[serde(deserialize_with = "lenient_text")]
    pub key_dates: String,
    #[serde(deserialize_with = "lenient_text")]
    pub risk: String,
}

/// Part of an obligation a follow-up question is about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, EnumIter)]
#[strum(ascii_case_insensitive)]
pub enum Aspect {
    #[default]
    #[strum(serialize = "obligation")]
    Obligation,
    #[strum(serialize = "description")]
    Description,
    #[strum(serialize = "penalties", serialize = "penalty")]
    Penalties,
    #[strum(serialize = "dates", serialize = "key-dates")]
    Dates,
    #[strum(serialize = "risks", serialize = "risk")]
    Risks,
}

impl Aspect {
    pub fn label(self) -> &'static str {
        match self {
            Aspect::Obligation => "obligation",
            Aspect::Description => "description",
            Aspect::Penalties => "penalties",
            Aspect::Dates => "dates",
            Aspect::Risks => "risks",
        }
    }
}

impl Obligation {
    /// Question asking the assistant to explain one aspect of this obligation
    pub fn follow_up(&self, aspect: Aspect) -> String {
        let name = &self.entity_name;
        match aspect {
            Aspect::Obligation => format!(
                "Explain the following obligations of {}: {}",
                name, self.obligation_type
            ),
            Aspect::Description => format!(
                "Explain the following obligations of {}: {} - {}",
                name, self.obligation_type, self.description
            ),
            Aspect::Penalties => format!("Explain the following penalties: {}", self.penalties),
            Aspect::Dates => format!(
                "Explain the significance of these key dates for {}: {}",
                name, self.key_dates
            ),
            Aspect::Risks => format!("Explain the following risks to {}: {}", name, self.risk),
        }
    }

    /// One-line listing, e.g. `Tenant: Rent payment (due monthly)`
    pub fn headline(&self) -> String {
        if self.description.is_empty() {
            format!("{}: {}", self.entity_name, self.obligation_type)
        } else {
            format!(
                "{}: {} ({})",
                self.entity_name, self.obligation_type, self.description
            )
        }
    }
}

/// Read the obligations array out of a model answer.
///
/// The array is taken from the first ```` ```json ```` fenced block. An answer
/// that is nothing but a bare JSON array is accepted as well.
pub fn parse_obligations(output: &str) -> Result<Vec<Obligation>> {
    let block = fenced_json(output)
        .or_else(|| {
            let bare = output.trim();
            (bare.starts_with('[') && bare.ends_with(']')).then_some(bare)
        })
        .ok_or_else(|| Error::Extraction("No JSON block found in the model output".to_string()))?;

    serde_json::from_str(block)
        .map_err(|e| Error::Extraction(format!("Obligations block is not a valid JSON array: {}", e)))
}

/// Contents of the first ```` ```json ```` block, without the fences
pub fn fenced_json(output: &str) -> Option<&str> {
    let start = output.find(JSON_FENCE)? + JSON_FENCE.len();
    let rest = &output[start..];
    // Skip whatever else sits on the opening fence line
    let body = &rest[rest.find('\n')? + 1..];
    let end = body.find(FENCE)?;
    Some(body[..end].trim())
}

/// Models sometimes answer a text field with null, a number or a list
fn lenient_text<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => String::new(),
        Value::String(text) => text,
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    })
}

//! Retrieved-context citations and their response-header encoding

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::providers::RetrievedDocument;

/// Header carrying the message ordinal of an exchange
pub const MESSAGE_INDEX_HEADER: &str = "x-message-index";
/// Header carrying the base64 JSON citation list of an exchange
pub const SOURCES_HEADER: &str = "x-sources";

/// Default excerpt length in characters
pub const DEFAULT_EXCERPT_CHARS: usize = 50;

/// A retrieved excerpt backing an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(alias = "pageContent")]
    pub excerpt: String,
    #[serde(default, alias = "metadata")]
    pub locator: Value,
}

impl Citation {
    pub fn new(excerpt: impl Into<String>, locator: Value) -> Self {
        Self {
            excerpt: excerpt.into(),
            locator,
        }
    }

    /// Build a citation from a search hit, keeping the first `excerpt_chars`
    /// characters of its text.
    pub fn from_document(doc: &RetrievedDocument, excerpt_chars: usize) -> Self {
        let excerpt: String = doc.text.chars().take(excerpt_chars).collect();
        Self {
            excerpt: format!("{}...", excerpt),
            locator: doc.metadata.clone(),
        }
    }

    /// Page number stored in the locator, either as a flat `loc.pageNumber`
    /// key or nested under `loc`.
    pub fn page_number(&self) -> Option<&Value> {
        self.locator
            .get("loc.pageNumber")
            .or_else(|| self.locator.get("loc").and_then(|loc| loc.get("pageNumber")))
            .filter(|page| !page.is_null())
    }

    /// Key used for deduplication
    fn locator_key(&self) -> String {
        match self.page_number() {
            Some(page) => format!("page:{}", page),
            None => self.locator.to_string(),
        }
    }
}

/// Encode citations for the `x-sources` header.
pub fn encode_header(citations: &[Citation]) -> Result<String> {
    let json = serde_json::to_vec(citations)?;
    Ok(STANDARD.encode(json))
}

/// Decode an `x-sources` header value.
pub fn decode_header(value: &str) -> Result<Vec<Citation>> {
    let bytes = STANDARD
        .decode(value.trim())
        .map_err(|e| Error::CitationHeader(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::CitationHeader(e.to_string()))
}

/// Citations per message ordinal, deduplicated by locator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitationSet {
    entries: BTreeMap<usize, Vec<Citation>>,
}

impl CitationSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge citations for `ordinal`, keeping the first citation seen for
    /// each locator. Returns how many were added.
    pub fn merge(&mut self, ordinal: usize, citations: impl IntoIterator<Item = Citation>) -> usize {
        let entry = self.entries.entry(ordinal).or_default();
        let mut added = 0;
        for citation in citations {
            let key = citation.locator_key();
            if entry.iter().any(|existing| existing.locator_key() == key) {
                continue;
            }
            entry.push(citation);
            added += 1;
        }
        if entry.is_empty() {
            self.entries.remove(&ordinal);
        }
        added
    }

    pub fn get(&self, ordinal: usize) -> &[Citation] {
        self.entries
            .get(&ordinal)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &[Citation])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn page(n: u64, excerpt: &str) -> Citation {
        Citation::new(excerpt, json!({ "loc": { "pageNumber": n } }))
    }

    #[test]
    fn test_from_document_truncates_excerpt() {
        let doc = RetrievedDocument {
            text: "x".repeat(80),
            metadata: json!({ "loc.pageNumber": 4 }),
        };
        let citation = Citation::from_document(&doc, DEFAULT_EXCERPT_CHARS);
        assert_eq!(citation.excerpt, format!("{}...", "x".repeat(50)));
        assert_eq!(citation.page_number(), Some(&json!(4)));
    }

    #[test]
    fn test_from_document_counts_characters() {
        let doc = RetrievedDocument {
            text: "Kündigungsfrist".to_string(),
            metadata: Value::Null,
        };
        let citation = Citation::from_document(&doc, 3);
        assert_eq!(citation.excerpt, "Kün...");
    }

    #[test]
    fn test_page_number_lookup() {
        assert_eq!(page(7, "a").page_number(), Some(&json!(7)));
        let flat = Citation::new("b", json!({ "loc.pageNumber": 2 }));
        assert_eq!(flat.page_number(), Some(&json!(2)));
        let none = Citation::new("c", json!({ "source": "upload.pdf" }));
        assert_eq!(none.page_number(), None);
    }

    #[test]
    fn test_merge_dedups_by_locator_preserving_order() {
        let mut set = CitationSet::new();
        let added = set.merge(1, vec![page(3, "first"), page(1, "second"), page(3, "dup")]);
        assert_eq!(added, 2);
        let excerpts: Vec<&str> = set.get(1).iter().map(|c| c.excerpt.as_str()).collect();
        assert_eq!(excerpts, vec!["first", "second"]);
    }

    #[test]
    fn test_merge_flat_and_nested_page_collapse() {
        let mut set = CitationSet::new();
        set.merge(
            1,
            vec![
                Citation::new("nested", json!({ "loc": { "pageNumber": 5 } })),
                Citation::new("flat", json!({ "loc.pageNumber": 5 })),
            ],
        );
        assert_eq!(set.get(1).len(), 1);
        assert_eq!(set.get(1)[0].excerpt, "nested");
    }

    #[test]
    fn test_merge_accumulates_across_updates() {
        let mut set = CitationSet::new();
        set.merge(3, vec![page(1, "a")]);
        set.merge(3, vec![page(1, "again"), page(2, "b")]);
        set.merge(5, vec![page(9, "other exchange")]);
        assert_eq!(set.get(3).len(), 2);
        assert_eq!(set.get(5).len(), 1);
        assert!(set.get(4).is_empty());
    }

    #[test]
    fn test_merge_empty_leaves_no_entry() {
        let mut set = CitationSet::new();
        assert_eq!(set.merge(1, Vec::new()), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_header_round_trip() {
        let citations = vec![page(1, "Die Mietzeit beginnt..."), page(2, "Payment due...")];
        let header = encode_header(&citations).unwrap();
        assert!(!header.contains('{'));
        assert_eq!(decode_header(&header).unwrap(), citations);
    }

    #[test]
    fn test_decode_header_accepts_page_content_spelling() {
        let header = STANDARD.encode(r#"[{"pageContent":"Rent is due...","metadata":{"loc":{"pageNumber":2}}}]"#);
        let decoded = decode_header(&header).unwrap();
        assert_eq!(decoded, vec![page(2, "Rent is due...")]);
    }

    #[test]
    fn test_decode_header_rejects_garbage() {
        assert!(matches!(
            decode_header("not base64!"),
            Err(Error::CitationHeader(_))
        ));
    }
}

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::Duration;

use super::{RetrievedDocument, SearchProvider};
use crate::error::{Error, Result};

/// Similarity search through a Supabase PostgREST function
#[derive(Clone)]
pub struct SupabaseSearch {
    client: reqwest::Client,
    url: String,
    service_key: String,
    function: String,
}

/// Row returned by the search function
#[derive(Debug, Deserialize)]
struct MatchRow {
    text_chunk: String,
    #[serde(default)]
    metadata: Value,
}

impl SupabaseSearch {
    pub fn new(url: impl Into<String>, service_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            url: url.into().trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            function: "docusuite_search".to_string(),
        })
    }

    pub fn with_function(mut self, function: impl Into<String>) -> Self {
        self.function = function.into();
        self
    }

    fn rpc_url(&self) -> String {
        format!("{}/rest/v1/rpc/{}", self.url, self.function)
    }
}

#[async_trait]
impl SearchProvider for SupabaseSearch {
    async fn search(
        &self,
        scope_id: &str,
        vector: &[f32],
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<RetrievedDocument>> {
        let payload = json!({
            "document_id": scope_id,
            "match_count": top_k,
            "query_embedding": vector,
            "similarity_threshold": threshold,
        });

        let response = self
            .client
            .post(self.rpc_url())
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
            .json(&payload)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // PostgREST reports failures as {"message": ...}
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(body);
            return Err(Error::Search(format!("Supabase search error ({}): {}", status, message)));
        }

        let rows: Vec<MatchRow> = response.json().await?;
        tracing::debug!(scope = scope_id, hits = rows.len(), "Similarity search finished");

        Ok(rows
            .into_iter()
            .map(|row| RetrievedDocument {
                text: row.text_chunk,
                metadata: row.metadata,
            })
            .collect())
    }
}

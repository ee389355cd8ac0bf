use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub(crate) const GEMINI_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub(crate) const SUPABASE_URL_ENV: &str = "SUPABASE_URL";
pub(crate) const SUPABASE_KEY_ENV: &str = "SUPABASE_SERVICE_ROLE_KEY";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key for the Gemini API
    pub gemini_api_key: Option<String>,

    /// Generation and embedding models
    pub gemini: GeminiConfig,

    /// Vector store holding the document chunks
    pub supabase: SupabaseConfig,

    /// Similarity search parameters
    pub retrieval: RetrievalConfig,

    /// HTTP server settings
    pub server: ServerConfig,

    /// Terminal client settings
    pub client: ClientConfig,

    /// File this configuration was loaded from and is saved to
    #[serde(skip)]
    pub config_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub base_url: String,
    pub chat_model: String,
    pub summary_model: String,
    pub embedding_model: String,
    pub temperature: Option<f32>,
    pub max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    pub url: Option<String>,
    pub service_key: Option<String>,
    /// Postgres function performing the similarity search
    pub search_function: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Required embedding length
    pub dimensions: usize,
    pub match_count: usize,
    pub similarity_threshold: f32,
    /// Characters of each chunk kept in its citation
    pub excerpt_chars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of a running `docusuite serve`
    pub endpoint: String,
}

impl Default for Config {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        Config {
            gemini_api_key: None,
            gemini: GeminiConfig::default(),
            supabase: SupabaseConfig::default(),
            retrieval: RetrievalConfig::default(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
            config_path: home.join(".docusuite").join("config.toml"),
        }
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            chat_model: "gemini-1.5-flash".to_string(),
            summary_model: "gemini-1.5-flash".to_string(),
            embedding_model: "text-embedding-004".to_string(),
            temperature: None,
            max_output_tokens: None,
        }
    }
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            service_key: None,
            search_function: "docusuite_search".to_string(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            dimensions: 768,
            match_count: 3,
            similarity_threshold: 0.1,
            excerpt_chars: crate::citations::DEFAULT_EXCERPT_CHARS,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:3000".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from `~/.docusuite/config.toml`
    pub fn load() -> Result<Self> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        let docusuite_home = home.join(".docusuite");

        fs::create_dir_all(&docusuite_home)
            .context("Failed to create .docusuite directory")?;

        Self::load_from(&docusuite_home.join("config.toml"))
    }

    /// Load configuration from a specific file, falling back to defaults when
    /// it does not exist
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else {
            Config::default()
        };
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Save configuration to the file it was loaded from
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;
        fs::write(&self.config_path, content)
            .with_context(|| format!("Failed to write config file {}", self.config_path.display()))?;
        Ok(())
    }

    /// Get the Gemini API key from config or environment
    pub fn gemini_api_key(&self) -> Option<String> {
        self.gemini_api_key
            .clone()
            .or_else(|| std::env::var(GEMINI_API_KEY_ENV).ok())
    }

    /// Get the Supabase project URL from config or environment
    pub fn supabase_url(&self) -> Option<String> {
        self.supabase
            .url
            .clone()
            .or_else(|| std::env::var(SUPABASE_URL_ENV).ok())
    }

    /// Get the Supabase service key from config or environment
    pub fn supabase_key(&self) -> Option<String> {
        self.supabase
            .service_key
            .clone()
            .or_else(|| std::env::var(SUPABASE_KEY_ENV).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.retrieval.dimensions, 768);
        assert_eq!(config.retrieval.match_count, 3);
        assert_eq!(config.gemini.embedding_model, "text-embedding-004");
        assert_eq!(config.supabase.search_function, "docusuite_search");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "gemini_api_key = \"k\"\n\n[server]\nbind = \"0.0.0.0:8080\"\n\n[retrieval]\nmatch_count = 5\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.gemini_api_key(), Some("k".to_string()));
        assert_eq!(config.server.bind, "0.0.0.0:8080");
        assert_eq!(config.retrieval.match_count, 5);
        assert_eq!(config.retrieval.dimensions, 768);
        assert_eq!(config.client.endpoint, "http://127.0.0.1:3000");
        assert_eq!(config.config_path, path);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.config_path = dir.path().join("config.toml");
        config.client.endpoint = "http://10.0.0.2:3000".to_string();
        config.save().unwrap();

        let loaded = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(loaded.client.endpoint, "http://10.0.0.2:3000");
    }

    #[test]
    fn test_custom_path_is_kept_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("custom.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.config_path, path);

        config.save().unwrap();
        assert!(path.exists());
        assert!(!dir.path().join("nested").join("config.toml").exists());
    }

    #[test]
    fn test_custom_file_name_is_saved_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[server]\nbind = \"0.0.0.0:1\"\n").unwrap();

        let mut config = Config::load_from(&path).unwrap();
        config.server.bind = "0.0.0.0:2".to_string();
        config.save().unwrap();

        assert!(!dir.path().join("config.toml").exists());
        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.server.bind, "0.0.0.0:2");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "server = 12").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use tokio::io::BufReader;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::consumer::{self, StreamConsumer};
use crate::events::{ChatEvent, ContractRequest};
use crate::producer::StreamProducer;
use crate::providers::{GeminiClient, SupabaseSearch};
use crate::server;
use crate::streaming::StreamController;
use crate::ui::conversation::ConversationManager;

/// Wire the configured Gemini and Supabase clients into a producer
pub fn build_producer(config: &Config) -> Result<StreamProducer> {
    let api_key = config.gemini_api_key().context(
        "Gemini API key missing: set GEMINI_API_KEY or gemini_api_key in ~/.docusuite/config.toml",
    )?;
    let supabase_url = config
        .supabase_url()
        .context("Supabase URL missing: set SUPABASE_URL or [supabase] url")?;
    let supabase_key = config
        .supabase_key()
        .context("Supabase key missing: set SUPABASE_SERVICE_ROLE_KEY or [supabase] service_key")?;

    let gemini = GeminiClient::new(api_key)?
        .with_base_url(&config.gemini.base_url)
        .with_chat_model(&config.gemini.chat_model)
        .with_embedding_model(&config.gemini.embedding_model);
    let summarizer = gemini.clone().with_chat_model(&config.gemini.summary_model);
    let search = SupabaseSearch::new(supabase_url, supabase_key)?
        .with_function(&config.supabase.search_function);

    let gemini = Arc::new(gemini);
    Ok(StreamProducer::new(gemini.clone(), Arc::new(search), gemini)
        .with_summarizer(Arc::new(summarizer))
        .with_retrieval(config.retrieval.clone())
        .with_generation_options(config.gemini.temperature, config.gemini.max_output_tokens))
}

pub async fn serve(config: &Config, bind: Option<String>) -> Result<()> {
    let producer = build_producer(config)?;
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    tracing::info!(
        chat_model = %config.gemini.chat_model,
        embedding_model = %config.gemini.embedding_model,
        "Starting Docusuite server"
    );

    server::serve(listener, producer)
        .await
        .context("Server terminated unexpectedly")?;
    Ok(())
}

pub async fn chat(
    config: &Config,
    endpoint: Option<String>,
    chat_id: &str,
    contract: Option<&Path>,
) -> Result<()> {
    let endpoint = endpoint.unwrap_or_else(|| config.client.endpoint.clone());
    let consumer = StreamConsumer::new(&endpoint, chat_id)?;

    let obligations = match contract {
        Some(file) => {
            let text = read_contract(file)?;
            println!("🔍 Reading obligations from {}...", file.display());
            let obligations = consumer::fetch_obligations(&reqwest::Client::new(), &endpoint, &text)
                .await
                .context("Failed to extract obligations")?;
            println!("   Found {}; list them with /obligations", obligations.len());
            obligations
        }
        None => Vec::new(),
    };

    let mut manager =
        ConversationManager::new(consumer, std::io::stdout()).with_obligations(obligations);
    manager.run(BufReader::new(tokio::io::stdin())).await?;

    println!("👋 Bye!");
    Ok(())
}

fn read_contract(file: &Path) -> Result<String> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    if text.trim().is_empty() {
        bail!("{} is empty", file.display());
    }
    Ok(text)
}

pub async fn summarize(config: &Config, endpoint: Option<String>, file: &Path) -> Result<()> {
    let text = read_contract(file)?;

    let endpoint = endpoint.unwrap_or_else(|| config.client.endpoint.clone());
    let url = format!("{}/api/summary", endpoint.trim_end_matches('/'));
    let client = reqwest::Client::new();

    let response = consumer::post_json(&client, &url, &ContractRequest { text }).await?;
    let mut frames = Box::pin(consumer::frames(response));
    let mut controller = StreamController::new();

    println!("📄 Summary of {}\n", file.display());
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let event = if frame.is_terminal() {
            ChatEvent::Finished
        } else {
            ChatEvent::Delta(frame.text)
        };
        for line in controller.process_event(&event) {
            println!("{}", line);
        }
        if event.is_terminal() {
            return Ok(());
        }
    }

    bail!("Summary stream ended before it was complete")
}

/// Print the obligations found in a contract
pub async fn obligations(config: &Config, endpoint: Option<String>, file: &Path) -> Result<()> {
    let text = read_contract(file)?;
    let endpoint = endpoint.unwrap_or_else(|| config.client.endpoint.clone());

    let obligations = consumer::fetch_obligations(&reqwest::Client::new(), &endpoint, &text).await?;
    if obligations.is_empty() {
        println!("No obligations found in {}", file.display());
        return Ok(());
    }

    println!("📋 Obligations in {}\n", file.display());
    for (number, obligation) in obligations.iter().enumerate() {
        println!("{}. {}", number + 1, obligation.headline());
        for (label, value) in [
            ("Penalties", &obligation.penalties),
            ("Key dates", &obligation.key_dates),
            ("Risk", &obligation.risk),
        ] {
            if !value.is_empty() {
                println!("   {}: {}", label, value);
            }
        }
    }
    println!("\nAsk about one with: docusuite chat --chat-id <id> --contract {} then /explain <n>", file.display());
    Ok(())
}

/// Print the effective configuration, or write defaults with `init`
pub fn config(config: &Config, init: bool) -> Result<()> {
    let path = &config.config_path;
    if init {
        if path.exists() {
            bail!("{} already exists", path.display());
        }
        config.save()?;
        println!("✨ Wrote default configuration to {}", path.display());
        return Ok(());
    }

    let mask = |value: Option<String>| match value {
        Some(_) => "set",
        None => "missing",
    };

    println!("📍 Config file: {}", path.display());
    println!("   Gemini API key: {}", mask(config.gemini_api_key()));
    println!("   Chat model: {}", config.gemini.chat_model);
    println!("   Summary model: {}", config.gemini.summary_model);
    println!("   Embedding model: {} ({} dims)", config.gemini.embedding_model, config.retrieval.dimensions);
    println!("   Supabase URL: {}", config.supabase_url().unwrap_or_else(|| "missing".to_string()));
    println!("   Supabase key: {}", mask(config.supabase_key()));
    println!(
        "   Search: {} (top {}, threshold {})",
        config.supabase.search_function, config.retrieval.match_count, config.retrieval.similarity_threshold
    );
    println!("   Server bind: {}", config.server.bind);
    println!("   Client endpoint: {}", config.client.endpoint);
    Ok(())
}

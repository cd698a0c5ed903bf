use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::ValueEnum;

use crate::backend::LlmBackend;
use crate::cli::Provider;
use crate::config::RuntimeConfig;
use crate::openai::{OpenAiCompatibleBackend, OpenAiCompatibleConfig};

pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";
pub const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";
pub const GROQ_API_BASE: &str = "https://api.groq.com/openai/v1";
pub const OLLAMA_DEFAULT_HOST: &str = "http://localhost:11434";

pub fn provider_label(provider: Provider) -> &'static str {
    match provider {
        Provider::Auto => "auto",
        Provider::Openai => "openai",
        Provider::Deepseek => "deepseek",
        Provider::Groq => "groq",
        Provider::Ollama => "ollama",
    }
}

pub fn validate_model_for_provider(provider: Provider, model_name: &str) -> Result<()> {
    let is_valid = match provider {
        Provider::Openai => {
            model_name.starts_with("gpt-")
                || model_name.starts_with("o1")
                || model_name.starts_with("o3")
                || model_name.starts_with("o4")
        }
        Provider::Deepseek => model_name.starts_with("deepseek"),
        Provider::Groq | Provider::Ollama => !model_name.trim().is_empty(),
        Provider::Auto => true,
    };

    if is_valid {
        return Ok(());
    }

    Err(anyhow::anyhow!(
        "model '{}' is not compatible with provider '{}'",
        model_name,
        provider_label(provider)
    ))
}

/// Backend plus the provider and model it was resolved to.
pub struct ResolvedBackend {
    pub backend: Arc<dyn LlmBackend>,
    pub provider: Provider,
    pub model: String,
}

pub fn resolve_backend(cfg: &RuntimeConfig) -> Result<ResolvedBackend> {
    let provider = match cfg.provider {
        Provider::Auto => detect_provider().context(
            "no provider could be auto-detected. Set one of OPENAI_API_KEY, DEEPSEEK_API_KEY, \
             GROQ_API_KEY, OLLAMA_HOST, or use --provider ollama",
        )?,
        p => p,
    };

    let (api_key, default_base, default_model) = match provider {
        Provider::Openai => (
            Some(required_api_key("OPENAI_API_KEY", "OpenAI")?),
            OPENAI_API_BASE.to_string(),
            "gpt-4o-mini",
        ),
        Provider::Deepseek => (
            Some(required_api_key("DEEPSEEK_API_KEY", "DeepSeek")?),
            DEEPSEEK_API_BASE.to_string(),
            "deepseek-chat",
        ),
        Provider::Groq => (
            Some(required_api_key("GROQ_API_KEY", "Groq")?),
            GROQ_API_BASE.to_string(),
            "llama-3.3-70b-versatile",
        ),
        Provider::Ollama => {
            let host = std::env::var("OLLAMA_HOST")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| OLLAMA_DEFAULT_HOST.to_string());
            (None, format!("{}/v1", host.trim_end_matches('/')), "llama3.1")
        }
        Provider::Auto => unreachable!("auto provider must be resolved before matching"),
    };

    let model = cfg
        .model
        .clone()
        .unwrap_or_else(|| default_model.to_string());
    validate_model_for_provider(provider, &model)?;

    let backend = OpenAiCompatibleBackend::new(OpenAiCompatibleConfig {
        label: provider_label(provider).to_string(),
        api_base: cfg.api_base.clone().unwrap_or(default_base),
        api_key,
        model: model.clone(),
        request_timeout: Duration::from_secs(cfg.task_timeout_secs.max(1)),
        max_retries: cfg.max_retries,
    })
    .with_context(|| format!("failed to initialize {} provider", provider_label(provider)))?;

    tracing::info!(
        provider = provider_label(provider),
        model = model.as_str(),
        "llm backend resolved"
    );

    Ok(ResolvedBackend {
        backend: Arc::new(backend),
        provider,
        model,
    })
}

pub fn detect_provider() -> Option<Provider> {
    if env_present("OPENAI_API_KEY") {
        return Some(Provider::Openai);
    }
    if env_present("DEEPSEEK_API_KEY") {
        return Some(Provider::Deepseek);
    }
    if env_present("GROQ_API_KEY") {
        return Some(Provider::Groq);
    }
    if env_present("OLLAMA_HOST") {
        return Some(Provider::Ollama);
    }
    None
}

pub fn env_present(key: &str) -> bool {
    non_blank(std::env::var(key).ok()).is_some()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn required_api_key(key: &str, provider_name: &str) -> Result<String> {
    api_key_from(key, provider_name, std::env::var(key).ok())
}

/// Blank values count as missing so the run fails before any task starts.
fn api_key_from(key: &str, provider_name: &str, value: Option<String>) -> Result<String> {
    non_blank(value).with_context(|| {
        format!("{key} is required for {provider_name} provider and must not be empty")
    })
}

pub fn parse_provider_name(value: &str) -> Result<Provider> {
    Provider::from_str(value, true).map_err(|_| {
        anyhow::anyhow!(
            "invalid provider '{}'. Supported values: auto, openai, deepseek, groq, ollama",
            value
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_validation_follows_provider_prefixes() {
        assert!(validate_model_for_provider(Provider::Openai, "gpt-4o-mini").is_ok());
        assert!(validate_model_for_provider(Provider::Openai, "deepseek-chat").is_err());
        assert!(validate_model_for_provider(Provider::Deepseek, "deepseek-reasoner").is_ok());
        assert!(validate_model_for_provider(Provider::Ollama, "  ").is_err());
    }

    #[test]
    fn provider_names_parse_case_insensitively() {
        assert_eq!(parse_provider_name("OpenAI").unwrap(), Provider::Openai);
        let err = parse_provider_name("gemini").unwrap_err();
        assert!(err.to_string().contains("Supported values"));
    }

    #[test]
    fn blank_api_key_is_treated_as_missing() {
        let err = api_key_from("OPENAI_API_KEY", "OpenAI", Some("   ".to_string())).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY is required"));
        assert!(api_key_from("GROQ_API_KEY", "Groq", None).is_err());
        assert_eq!(
            api_key_from("GROQ_API_KEY", "Groq", Some(" gsk-123 \n".to_string())).unwrap(),
            "gsk-123"
        );
    }

    #[test]
    fn ollama_resolves_without_key() {
        let cfg = RuntimeConfig {
            provider: Provider::Ollama,
            model: Some("qwen2.5".to_string()),
            api_base: Some("http://127.0.0.1:11434/v1".to_string()),
            ..RuntimeConfig::default()
        };
        let resolved = resolve_backend(&cfg).expect("ollama needs no key");
        assert_eq!(resolved.provider, Provider::Ollama);
        assert_eq!(resolved.model, "qwen2.5");
        assert_eq!(resolved.backend.name(), "ollama");
    }
}

// Configuration management module
// TOML settings for the hosted services, chunking and retrieval

pub mod settings;


use anyhow::{Context, Result};
use console::style;

pub use settings::{
    Config, ConfigError, DEFAULT_EMBEDDING_DIMENSION, RetrievalConfig, ServiceConfig,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Write a default configuration file unless one already exists
#[inline]
pub fn init_config() -> Result<Config> {
    let dir = get_config_dir()?;
    let config = Config::load(&dir).context("Failed to load configuration")?;
    if !config.config_file_path().exists() {
        config.save().context("Failed to save configuration")?;
        eprintln!(
            "{} {}",
            style("✓ Wrote default configuration to").green(),
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!(
            "Configuration already exists at {}",
            style(config.config_file_path().display()).cyan()
        );
    }
    Ok(config)
}

#[inline]
pub fn show_config() -> Result<()> {
    let config = Config::load(get_config_dir()?).context("Failed to load configuration")?;

    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();

    eprintln!("{}", style("Service:").bold().yellow());
    eprintln!("  Base URL: {}", style(&config.service.base_url).cyan());
    eprintln!("  API key variable: {}", style(&config.service.api_key_env).cyan());
    eprintln!(
        "  Embedding model: {} ({} dims)",
        style(&config.service.embedding_model).cyan(),
        style(config.service.embedding_dimension).cyan()
    );
    eprintln!("  Chat model: {}", style(&config.service.chat_model).cyan());

    eprintln!();
    eprintln!("{}", style("Chunking:").bold().yellow());
    eprintln!("  Max tokens per chunk: {}", style(config.chunking.max_tokens).cyan());
    eprintln!(
        "  Min page characters: {}",
        style(config.chunking.min_page_chars).cyan()
    );
    eprintln!("  OCR fallback: {}", style(config.chunking.ocr_fallback).cyan());

    eprintln!();
    eprintln!("{}", style("Retrieval:").bold().yellow());
    eprintln!("  Top k: {}", style(config.retrieval.top_k).cyan());
    eprintln!(
        "  Embedding concurrency: {}",
        style(config.retrieval.embedding_concurrency).cyan()
    );
    eprintln!(
        "  Embedding cache capacity: {}",
        style(config.retrieval.cache_capacity).cyan()
    );

    eprintln!();
    eprintln!("Config file: {}", style(config.config_file_path().display()).dim());

    Ok(())
}

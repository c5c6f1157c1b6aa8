
use anyhow::{Context, Result};
use console::style;
use dialoguer::{Confirm, Input, Password, Select};
use std::path::Path;

use super::settings::{mask_secret, normalize_endpoint};
use super::{Config, CosmosConfig, EmbeddingConfig, SearchConfig, StorageMode};

#[inline]
pub fn run_interactive_config(config_dir: &Path) -> Result<()> {
    eprintln!("{}", style("🔧 medctx Configuration Setup").bold().cyan());
    eprintln!();

    let mut config = load_existing_config(config_dir)?;

    let modes = &["local", "managed"];
    let default_index = usize::from(config.storage_mode == StorageMode::Managed);
    let mode_index = Select::new()
        .with_prompt("Storage mode")
        .default(default_index)
        .items(modes)
        .interact()?;
    config.storage_mode = modes[mode_index].parse()?;

    eprintln!();
    eprintln!("{}", style("Embedding Provider (Azure OpenAI)").bold().yellow());
    configure_embedding(&mut config.embedding)?;

    if config.storage_mode == StorageMode::Managed {
        eprintln!();
        eprintln!("{}", style("Azure Cosmos DB").bold().yellow());
        configure_cosmos(&mut config.cosmos)?;

        eprintln!();
        eprintln!("{}", style("Azure AI Search").bold().yellow());
        configure_search(&mut config.search)?;

        eprintln!();
        eprintln!("{}", style("Testing configuration...").yellow());
        for (name, endpoint) in [
            ("Cosmos DB", config.cosmos.endpoint.as_deref()),
            ("AI Search", config.search.endpoint.as_deref()),
        ] {
            match endpoint {
                Some(ep) if probe_endpoint(ep) => {
                    eprintln!("{}", style(format!("✓ {name} reachable")).green());
                }
                _ => eprintln!(
                    "{}",
                    style(format!("⚠ Warning: could not reach {name}")).yellow()
                ),
            }
        }
    }

    config.validate().context("Configuration is not valid")?;
    if config.storage_mode == StorageMode::Managed {
        if let Err(e) = config.managed_credentials() {
            eprintln!("{}", style(format!("⚠ {e}")).yellow());
        }
    }

    eprintln!();
    if Confirm::new()
        .with_prompt("Save configuration?")
        .default(true)
        .interact()?
    {
        config.save().context("Failed to save configuration")?;
        eprintln!("{}", style("✓ Configuration saved successfully!").green());
        eprintln!(
            "Configuration saved to: {}",
            style(config.config_file_path().display()).cyan()
        );
    } else {
        eprintln!("Configuration not saved.");
    }

    Ok(())
}

#[inline]
pub fn show_config(config: &Config) -> Result<()> {
    eprintln!("{}", style("📋 Current Configuration").bold().cyan());
    eprintln!();
    eprintln!("  Storage Mode: {}", style(config.storage_mode).cyan());
    eprintln!(
        "  Cache Directory: {}",
        style(config.cache_dir().display()).cyan()
    );
    eprintln!("  HTTP Timeout: {}s", style(config.http.timeout_seconds).cyan());

    eprintln!();
    eprintln!("{}", style("Embedding Settings:").bold().yellow());
    let embedding = &config.embedding;
    eprintln!("  Endpoint: {}", style(display_opt(&embedding.endpoint)).cyan());
    eprintln!(
        "  API Key: {}",
        style(mask_secret(embedding.api_key.as_deref())).cyan()
    );
    eprintln!(
        "  Deployment: {}",
        style(display_opt(&embedding.deployment)).cyan()
    );
    eprintln!("  Dimension: {}", style(embedding.dimension).cyan());
    eprintln!("  Batch Size: {}", style(embedding.batch_size).cyan());
    eprintln!(
        "  Batch Delay: {}s",
        style(embedding.batch_delay_seconds).cyan()
    );

    eprintln!();
    eprintln!("{}", style("Cosmos DB Settings:").bold().yellow());
    eprintln!(
        "  Endpoint: {}",
        style(display_opt(&config.cosmos.endpoint)).cyan()
    );
    eprintln!(
        "  Key: {}",
        style(mask_secret(config.cosmos.key.as_deref())).cyan()
    );
    eprintln!("  Database: {}", style(&config.cosmos.database).cyan());
    eprintln!(
        "  Containers: {} / {}",
        style(&config.cosmos.documents_container).cyan(),
        style(&config.cosmos.chunks_container).cyan()
    );

    eprintln!();
    eprintln!("{}", style("AI Search Settings:").bold().yellow());
    eprintln!(
        "  Endpoint: {}",
        style(display_opt(&config.search.endpoint)).cyan()
    );
    eprintln!(
        "  Key: {}",
        style(mask_secret(config.search.key.as_deref())).cyan()
    );
    eprintln!("  Index: {}", style(&config.search.index_name).cyan());

    if config.storage_mode == StorageMode::Managed {
        eprintln!();
        match config.managed_credentials() {
            Ok(_) => eprintln!("  Managed credentials: {}", style("complete").green()),
            Err(e) => eprintln!("  Managed credentials: {} ({})", style("incomplete").red(), e),
        }
    }

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}

fn load_existing_config(config_dir: &Path) -> Result<Config> {
    Config::load(config_dir).map_or_else(
        |_| {
            eprintln!(
                "{}",
                style("No usable configuration found. Using defaults.").yellow()
            );
            Ok(Config {
                base_dir: config_dir.to_path_buf(),
                ..Config::default()
            })
        },
        |config| {
            eprintln!("{}", style("Found existing configuration.").green());
            Ok(config)
        },
    )
}

fn configure_embedding(embedding: &mut EmbeddingConfig) -> Result<()> {
    embedding.endpoint = prompt_endpoint("Azure OpenAI endpoint", embedding.endpoint.as_deref())?;
    embedding.api_key = prompt_secret("Azure OpenAI API key", embedding.api_key.take())?;

    let deployment: String = Input::new()
        .with_prompt("Embedding deployment")
        .default(embedding.deployment.clone().unwrap_or_default())
        .allow_empty(true)
        .interact_text()?;
    embedding.deployment = Some(deployment).filter(|d| !d.trim().is_empty());

    embedding.dimension = Input::new()
        .with_prompt("Embedding dimension")
        .default(embedding.dimension)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=4096).contains(input) {
                Ok(())
            } else {
                Err("Dimension must be between 1 and 4096")
            }
        })
        .interact_text()?;

    embedding.batch_size = Input::new()
        .with_prompt("Batch size for embedding generation")
        .default(embedding.batch_size)
        .validate_with(|input: &usize| -> Result<(), &str> {
            if (1..=2048).contains(input) {
                Ok(())
            } else {
                Err("Batch size must be between 1 and 2048")
            }
        })
        .interact_text()?;

    Ok(())
}

fn configure_cosmos(cosmos: &mut CosmosConfig) -> Result<()> {
    cosmos.endpoint = prompt_endpoint("Cosmos DB endpoint", cosmos.endpoint.as_deref())?;
    cosmos.key = prompt_secret("Cosmos DB key", cosmos.key.take())?;
    cosmos.database = prompt_name("Database name", &cosmos.database)?;
    cosmos.documents_container = prompt_name("Documents container", &cosmos.documents_container)?;
    cosmos.chunks_container = prompt_name("Chunks container", &cosmos.chunks_container)?;
    Ok(())
}

fn configure_search(search: &mut SearchConfig) -> Result<()> {
    search.endpoint = prompt_endpoint("AI Search endpoint", search.endpoint.as_deref())?;
    search.key = prompt_secret("AI Search admin key", search.key.take())?;
    search.index_name = prompt_name("Index name", &search.index_name)?;
    Ok(())
}

fn prompt_endpoint(prompt: &str, current: Option<&str>) -> Result<Option<String>> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .default(current.unwrap_or_default().to_string())
        .allow_empty(true)
        .validate_with(|input: &String| -> Result<(), String> {
            if input.trim().is_empty() {
                return Ok(());
            }
            url::Url::parse(input.trim())
                .map(|_| ())
                .map_err(|e| format!("Invalid URL: {e}"))
        })
        .interact_text()?;
    Ok(Some(normalize_endpoint(&value)).filter(|v| !v.is_empty()))
}

fn prompt_secret(prompt: &str, current: Option<String>) -> Result<Option<String>> {
    let label = format!(
        "{prompt} [{}] (leave empty to keep)",
        mask_secret(current.as_deref())
    );
    let value = Password::new()
        .with_prompt(label)
        .allow_empty_password(true)
        .interact()?;
    if value.trim().is_empty() {
        Ok(current)
    } else {
        Ok(Some(value.trim().to_string()))
    }
}

fn prompt_name(prompt: &str, current: &str) -> Result<String> {
    let value: String = Input::new()
        .with_prompt(prompt)
        .default(current.to_string())
        .validate_with(|input: &String| -> Result<(), &str> {
            if input.trim().is_empty() {
                Err("Name cannot be empty")
            } else {
                Ok(())
            }
        })
        .interact_text()?;
    Ok(value.trim().to_string())
}

fn display_opt(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("(not set)")
}

fn probe_endpoint(endpoint: &str) -> bool {
    let agent: ureq::Agent = ureq::Agent::config_builder()
        .timeout_global(Some(std::time::Duration::from_secs(5)))
        .build()
        .into();

    match agent.get(endpoint).call() {
        Ok(_) => true,
        Err(ureq::Error::StatusCode(code)) if (400..500).contains(&code) => true,
        Err(_) => false,
    }
}

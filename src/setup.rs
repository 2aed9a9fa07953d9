use std::io::{self, BufRead, Write};

use anyhow::{bail, Context, Result};

use crate::config::{ConfigStore, ModelProfile, ServiceConfig};
use crate::http::Upstream;
use crate::relay::RelayService;

const CONSENT_TEXT: &str = "Factory data (entities, belts, fluids, signals, inventories) and \
chat history will be sent to the external OpenAI model to analyze your base and improve \
replies. By continuing you agree to this data leaving your machine.";

/// Interactive first-run flow: consent text, key entry, model choice, then a
/// connection check against the live API. Declining consent aborts without
/// touching the stored file.
pub async fn run_setup(store: &ConfigStore, mut config: ServiceConfig) -> Result<()> {
    println!("Factorio GPT relay setup\n");
    if !prompt_consent(&mut config)? {
        return Ok(());
    }
    prompt_api_key(&mut config)?;
    store.save(&config)?;

    let upstream = Upstream::from_env().context("failed to build the HTTP client")?;
    let service = RelayService::new(config, store.clone(), upstream);
    println!("Checking the OpenAI connection...");
    match service.verify_key().await {
        Ok(true) => println!("Connection confirmed."),
        Ok(false) => println!("No API key stored; nothing to check."),
        Err(err) => println!("Could not confirm the key: {}", err),
    }
    Ok(())
}

/// Print the on-disk form of the configuration, API key obfuscated.
pub fn run_status(config: &ServiceConfig) {
    println!("Current configuration:");
    println!("{}", config.to_disk_json());
}

pub fn run_reset(store: &ConfigStore) -> Result<()> {
    if store.reset()? {
        println!("Configuration removed.");
    } else {
        println!("No configuration to remove.");
    }
    Ok(())
}

fn prompt_consent(config: &mut ServiceConfig) -> Result<bool> {
    println!("=== Terms of use ===");
    println!("{}", CONSENT_TEXT);
    let answer = prompt("Continue? [y/N]: ")?;
    if !matches!(answer.trim().to_lowercase().as_str(), "y" | "yes") {
        println!("Consent not given. Setup aborted.");
        return Ok(false);
    }
    config.consent_acknowledged = true;
    Ok(true)
}

fn prompt_api_key(config: &mut ServiceConfig) -> Result<()> {
    let api_key = prompt("OpenAI API key: ")?.trim().to_string();
    if api_key.is_empty() {
        bail!("the API key cannot be empty");
    }
    config.api_key = Some(api_key);

    let organization = prompt("Organization id (Enter for none): ")?
        .trim()
        .to_string();
    config.organization = (!organization.is_empty()).then_some(organization);

    let mut model = prompt(&format!("Default model [{}]: ", config.default_model))?
        .trim()
        .to_string();
    if model.is_empty() {
        model = config.default_model.clone();
    }
    config
        .profiles
        .entry(model.clone())
        .or_insert_with(ModelProfile::standard);
    config.default_model = model;
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush().context("failed to flush stdout")?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read stdin")?;
    Ok(line)
}

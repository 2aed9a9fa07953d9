use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 3925;
pub const DEFAULT_MODEL: &str = "gpt-4o";

const CONFIG_DIR: &str = ".factorio-gpt";
const CONFIG_FILE: &str = "config.json";

/// Generation defaults tied to one model name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelProfile {
    pub temperature: f64,
    pub max_tokens: u32,
}

impl ModelProfile {
    /// Profile registered for models picked at setup time that have no tuned
    /// entry yet.
    pub fn standard() -> Self {
        Self {
            temperature: 0.4,
            max_tokens: 2048,
        }
    }
}

/// Service configuration as held in memory. The API key is kept in clear
/// here and base64-obfuscated in the on-disk form; that hides it from a
/// shoulder glance, it is not encryption.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub default_model: String,
    pub profiles: BTreeMap<String, ModelProfile>,
    pub host: String,
    pub port: u16,
    pub tls_enabled: bool,
    pub consent_acknowledged: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "gpt-4o".to_string(),
            ModelProfile {
                temperature: 0.4,
                max_tokens: 2048,
            },
        );
        profiles.insert(
            "gpt-4.1".to_string(),
            ModelProfile {
                temperature: 0.2,
                max_tokens: 2048,
            },
        );
        profiles.insert(
            "gpt-4.1-mini".to_string(),
            ModelProfile {
                temperature: 0.3,
                max_tokens: 1024,
            },
        );
        Self {
            api_key: None,
            organization: None,
            default_model: DEFAULT_MODEL.to_string(),
            profiles,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            tls_enabled: false,
            consent_acknowledged: false,
        }
    }
}

impl ServiceConfig {
    /// Apply a partial update. Only the fields the patch names change; a
    /// patched profile map replaces the stored one wholesale.
    pub fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(model) = patch.default_model {
            self.default_model = model;
        }
        if let Some(profiles) = patch.profiles {
            self.profiles = profiles;
        }
        if let Some(consent) = patch.consent_acknowledged {
            self.consent_acknowledged = consent;
        }
    }

    /// Render the on-disk JSON form, API key obfuscated.
    pub fn to_disk_json(&self) -> String {
        let stored = StoredConfig::from_config(self);
        serde_json::to_string_pretty(&stored).expect("config serializes")
    }
}

/// Partial update accepted by `POST /config`. Unknown top-level fields are
/// ignored; fields that are present must carry the right type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigPatch {
    pub default_model: Option<String>,
    pub profiles: Option<BTreeMap<String, ModelProfile>>,
    pub consent_acknowledged: Option<bool>,
}

// On-disk form, serialization side only. Loading goes through
// `config_from_stored` so one bad field cannot take the rest of the file
// down with it.
#[derive(Debug, Serialize)]
struct StoredConfig {
    api_key: Option<String>,
    organization: Option<String>,
    default_model: String,
    profiles: BTreeMap<String, ModelProfile>,
    host: String,
    port: u16,
    tls_enabled: bool,
    consent_acknowledged: bool,
}

impl StoredConfig {
    fn from_config(config: &ServiceConfig) -> Self {
        Self {
            api_key: encode_secret(config.api_key.as_deref()),
            organization: config.organization.clone(),
            default_model: config.default_model.clone(),
            profiles: config.profiles.clone(),
            host: config.host.clone(),
            port: config.port,
            tls_enabled: config.tls_enabled,
            consent_acknowledged: config.consent_acknowledged,
        }
    }
}

// Salvage the file field by field: a missing or wrong-typed field falls back
// to its default instead of discarding everything else the file holds. Older
// and hand-edited files stay loadable this way.
fn config_from_stored(stored: &Map<String, Value>) -> ServiceConfig {
    let defaults = ServiceConfig::default();
    ServiceConfig {
        api_key: decode_secret(
            stored_field::<Option<String>>(stored, "api_key")
                .flatten()
                .as_deref(),
        ),
        organization: stored_field::<Option<String>>(stored, "organization").flatten(),
        default_model: stored_field(stored, "default_model").unwrap_or(defaults.default_model),
        profiles: stored_field(stored, "profiles").unwrap_or(defaults.profiles),
        host: stored_field(stored, "host").unwrap_or(defaults.host),
        port: stored_field(stored, "port").unwrap_or(defaults.port),
        tls_enabled: stored_field(stored, "tls_enabled").unwrap_or(defaults.tls_enabled),
        consent_acknowledged: stored_field(stored, "consent_acknowledged")
            .unwrap_or(defaults.consent_acknowledged),
    }
}

fn stored_field<T: DeserializeOwned>(stored: &Map<String, Value>, name: &str) -> Option<T> {
    let value = stored.get(name)?;
    match serde_json::from_value(value.clone()) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            warn!("ignoring stored {}: {}", name, err);
            None
        }
    }
}

fn encode_secret(secret: Option<&str>) -> Option<String> {
    secret
        .filter(|s| !s.is_empty())
        .map(|s| BASE64.encode(s.as_bytes()))
}

// Best effort: a stored key that does not decode back to UTF-8 is treated as
// absent instead of failing the whole load.
fn decode_secret(stored: Option<&str>) -> Option<String> {
    let raw = stored.filter(|s| !s.is_empty())?;
    match BASE64.decode(raw.as_bytes()).map(String::from_utf8) {
        Ok(Ok(secret)) => Some(secret),
        _ => {
            warn!("stored API key is not readable; ignoring it");
            None
        }
    }
}

/// Where the configuration lives on disk and how it gets there.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// The standard location, `~/.factorio-gpt/config.json`.
    pub fn default_location() -> Result<Self> {
        let home = dirs::home_dir().context("could not determine the home directory")?;
        Ok(Self::new(home.join(CONFIG_DIR).join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored configuration, or the defaults when no file exists.
    /// Fields that fail to parse fall back to their defaults one by one; only
    /// a file that is not a JSON object at all fails the load.
    pub fn load(&self) -> Result<ServiceConfig> {
        if !self.path.exists() {
            return Ok(ServiceConfig::default());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let stored: Map<String, Value> = serde_json::from_str(&raw)
            .with_context(|| format!("malformed configuration in {}", self.path.display()))?;
        Ok(config_from_stored(&stored))
    }

    /// Write the configuration out, creating the directory on first use. The
    /// write goes through a temporary sibling and a rename so a crash cannot
    /// leave a half-written file behind.
    pub fn save(&self, config: &ServiceConfig) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, config.to_disk_json())
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        Ok(())
    }

    /// Delete the stored file. Returns whether there was one to delete.
    pub fn reset(&self) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))?;
        Ok(true)
    }
}

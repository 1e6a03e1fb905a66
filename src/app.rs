use crate::api::models::UserId;
use crate::error::{Error, Result};
use crate::push::backoff::ReconnectPolicy;
use directories::BaseDirs;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppState {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub user_id: Option<UserId>,
    /// Overrides the push endpoint derived from `base_url`.
    #[serde(default)]
    pub push_url: Option<String>,
    #[serde(default = "default_true")]
    pub cache_conversations: bool,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: None,
            user_id: None,
            push_url: None,
            cache_conversations: true,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    // TOML is the primary format; an older JSON state file is converted on first load.
    pub fn toml_path() -> Option<PathBuf> {
        let base = BaseDirs::new()?;
        Some(base.config_dir().join("petid-messenger.toml"))
    }

    fn legacy_json_path() -> Option<PathBuf> {
        let proj = directories::ProjectDirs::from("id", "petid", "PetIdMessenger")?;
        Some(proj.config_dir().join("state.json"))
    }

    pub fn load() -> Self {
        if let Some(path) = Self::toml_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(state) => return state,
                    Err(e) => warn!("ignoring unreadable config {}: {e}", path.display()),
                }
            }
        }

        if let Some(legacy) = Self::legacy_json_path() {
            if let Ok(bytes) = fs::read(&legacy) {
                if let Ok(state) = serde_json::from_slice::<AppState>(&bytes) {
                    debug!("migrating legacy config {}", legacy.display());
                    if let Err(e) = state.save() {
                        warn!("could not migrate legacy config: {e}");
                    }
                    return state;
                }
            }
        }

        Self::new()
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self) -> Result<()> {
        let path = Self::toml_path().ok_or_else(|| Error::Config("no config directory".into()))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn is_logged_in(&self) -> bool {
        !self.base_url.is_empty()
            && self.user_id.is_some()
            && self.token.as_deref().is_some_and(|t| !t.trim().is_empty())
    }
}

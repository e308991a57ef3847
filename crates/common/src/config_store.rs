// tunnel9 - Config Store Module
// Loads the ordered tunnel list from disk and persists committed edits

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::config::{ensure_unique_ids, ConfigFile, Settings, TunnelSpec, CONFIG_VERSION};
use crate::error::{Error, Result};

/// Storage boundary for the tunnel list
pub trait ConfigStore: Send + Sync {
    /// Load the config; a missing file is an empty config
    fn load(&self) -> Result<ConfigFile>;

    /// Persist the full ordered tunnel list
    fn save(&self, tunnels: &[TunnelSpec]) -> Result<()>;

    /// Where the config lives, for display
    fn location(&self) -> String;
}

/// Default config path: `$XDG_STATE_HOME/tunnel9/config.toml`
pub fn default_config_path() -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local").join("state")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tunnel9")
        .join("config.toml")
}

#[derive(Debug, Default)]
struct StoreState {
    /// Settings from the last successful load, written back on save
    settings: Settings,
    /// Set when an existing file failed to load; saving would destroy it
    load_failed: bool,
}

/// TOML file backed config store
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_file(&self) -> Result<ConfigFile> {
        let contents = fs::read_to_string(&self.path)?;
        let mut file: ConfigFile = toml::from_str(&contents)?;

        if file.version != CONFIG_VERSION {
            return Err(Error::UnsupportedVersion {
                path: self.path.clone(),
                found: file.version,
                expected: CONFIG_VERSION,
            });
        }

        file.normalize()?;
        Ok(file)
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<ConfigFile> {
        if !self.path.exists() {
            debug!("Config file does not exist: {}", self.path.display());
            let mut state = self.lock_state();
            state.settings = Settings::default();
            state.load_failed = false;
            return Ok(ConfigFile::default());
        }

        match self.read_file() {
            Ok(file) => {
                info!(
                    "Loaded {} tunnel(s) from {}",
                    file.tunnels.len(),
                    self.path.display()
                );
                let mut state = self.lock_state();
                state.settings = file.settings.clone();
                state.load_failed = false;
                Ok(file)
            }
            Err(e) => {
                warn!("Failed to load config {}: {}", self.path.display(), e);
                self.lock_state().load_failed = true;
                Err(e)
            }
        }
    }

    fn save(&self, tunnels: &[TunnelSpec]) -> Result<()> {
        let settings = {
            let state = self.lock_state();
            if state.load_failed {
                return Err(Error::Config(format!(
                    "{} could not be loaded; refusing to overwrite it",
                    self.path.display()
                )));
            }
            state.settings.clone()
        };

        ensure_unique_ids(tunnels)?;
        for spec in tunnels {
            spec.validate()?;
        }

        let file = ConfigFile {
            version: CONFIG_VERSION,
            settings,
            tunnels: tunnels.to_vec(),
        };
        let contents = toml::to_string_pretty(&file)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write next to the target, then rename over it
        let tmp_path = self.path.with_extension("toml.tmp");
        fs::write(&tmp_path, contents)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(
            "Saved {} tunnel(s) to {}",
            tunnels.len(),
            self.path.display()
        );
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

use serde_derive::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_ENV: &str = "P1_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Configured Role: {0} is not in the allowed list")]
    UnsupportedRole(String),
    #[error("AccessType {0} is not supported")]
    UnsupportedAccessType(String),
    #[error("Phases {0} is not supported, expected 1 or 3")]
    UnsupportedPhases(String),
    #[error("AccessType OnPremise requires Host in the [ONPREMISE] section")]
    MissingHost,
}

/// Contents of the configuration file. Keys keep the names used by the
/// smart gateway setup guides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(rename = "DEFAULT")]
    pub device: DeviceSettings,
    #[serde(rename = "ONPREMISE", default)]
    pub on_premise: Option<OnPremiseSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceSettings {
    pub device_instance: u32,
    #[serde(default)]
    pub custom_name: String,
    pub role: String,
    pub phases: PhasesValue,
    pub access_type: String,
    #[serde(default)]
    pub position: i64,
    /// Minutes between sign-of-life log entries, 0 disables them.
    #[serde(default)]
    pub sign_of_life_log: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OnPremiseSettings {
    pub host: String,
}

/// `Phases` as written in the file, either `3` or `"3"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PhasesValue {
    Number(i64),
    Text(String),
}

impl fmt::Display for PhasesValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhasesValue::Number(n) => write!(f, "{n}"),
            PhasesValue::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseCount {
    Single,
    Three,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    PvInverter,
    Grid,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::PvInverter => "pvinverter",
            Role::Grid => "grid",
        }
    }

    pub fn product_id(self) -> u16 {
        match self {
            Role::PvInverter => 0xA144,
            Role::Grid => 45069,
        }
    }
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pvinverter" => Ok(Role::PvInverter),
            "grid" => Ok(Role::Grid),
            other => Err(ConfigError::UnsupportedRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Settings {
    pub fn from_toml(path: &Path, content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn role(&self) -> Result<Role, ConfigError> {
        self.device.role.parse()
    }

    pub fn phase_count(&self) -> Result<PhaseCount, ConfigError> {
        let count = match &self.device.phases {
            PhasesValue::Number(n) => Some(*n),
            PhasesValue::Text(s) => s.trim().parse().ok(),
        };
        match count {
            Some(1) => Ok(PhaseCount::Single),
            Some(3) => Ok(PhaseCount::Three),
            _ => Err(ConfigError::UnsupportedPhases(self.device.phases.to_string())),
        }
    }

    /// URL of the gateway's JSON read-out for the configured access type.
    pub fn status_url(&self) -> Result<String, ConfigError> {
        match self.device.access_type.as_str() {
            "OnPremise" => {
                let host = self
                    .on_premise
                    .as_ref()
                    .map(|on_premise| on_premise.host.trim())
                    .filter(|host| !host.is_empty())
                    .ok_or(ConfigError::MissingHost)?;
                Ok(format!("http://{host}/smartmeter/api/read"))
            }
            other => Err(ConfigError::UnsupportedAccessType(other.to_string())),
        }
    }

    pub fn sign_of_life_interval(&self) -> Option<Duration> {
        match self.device.sign_of_life_log {
            0 => None,
            minutes => Some(Duration::from_secs(minutes * 60)),
        }
    }
}

/// Source of the current settings. Implementations may return different
/// settings on every call.
pub trait ConfigProvider: Send + Sync {
    fn settings(&self) -> Result<Settings, ConfigError>;
}

impl ConfigProvider for Settings {
    fn settings(&self) -> Result<Settings, ConfigError> {
        Ok(self.clone())
    }
}

/// Reads the configuration file again on every call, so edits take effect
/// without a restart.
#[derive(Debug, Clone)]
pub struct FileConfig {
    path: PathBuf,
}

impl FileConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Uses `P1_CONFIG` when set, otherwise `config.toml` beside the executable.
    pub fn from_env() -> Self {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::new(path);
        }
        let beside_exe = env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(DEFAULT_CONFIG_FILE)));
        Self::new(beside_exe.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigProvider for FileConfig {
    fn settings(&self) -> Result<Settings, ConfigError> {
        let content = fs::read_to_string(&self.path).map_err(|source| ConfigError::Read {
            path: self.path.clone(),
            source,
        })?;
        Settings::from_toml(&self.path, &content)
    }
}

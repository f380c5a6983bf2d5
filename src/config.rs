//! Runtime configuration
//!
//! Loaded once from TOML and handed to each component at construction.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::PolicyGuid;
use crate::error::{AppError, AppResult};

/// Environment variable that overrides `directory.password`
pub const PASSWORD_ENV: &str = "GPO_REGISTRY_PASSWORD";

/// The policy every domain ships with; its directory is the permission reference.
pub const DEFAULT_TEMPLATE_GUID: &str = "{31B2F340-016D-11D2-945F-00C04FB984F9}";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub directory: DirectoryConfig,
    pub sysvol: SysvolConfig,
    pub store: StoreConfig,
    pub signing: SigningConfig,
    pub tools: ToolsConfig,
    pub availability: AvailabilityConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// `ldap://host` or `ldaps://host`
    pub url: String,
    /// Bind identity, also passed to the policy tool
    pub user: String,
    pub password: String,
    /// Domain DN; read from the root DSE when unset
    pub base_dn: Option<String>,
    /// Pin every operation to one controller. Disables the consistency gate.
    pub controller: Option<String>,
    pub connect_timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost".to_string(),
            user: "Administrator".to_string(),
            password: String::new(),
            base_dn: None,
            controller: None,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SysvolConfig {
    /// Holds `<realm>/Policies/<GUID>`
    pub root: PathBuf,
}

impl Default for SysvolConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/var/lib/samba/sysvol"),
        }
    }
}

/// How policies are created and deleted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreStrategy {
    /// Shell out to the domain policy tool
    #[default]
    Tool,
    /// Write directory entries and the policy skeleton ourselves
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub strategy: StoreStrategy,
    pub tool: String,
    pub template_guid: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            strategy: StoreStrategy::Tool,
            tool: "samba-tool".to_string(),
            template_guid: DEFAULT_TEMPLATE_GUID.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningConfig {
    /// Contains `private/`, `public/` and `pfx/`
    pub keys_dir: PathBuf,
    pub openssl: String,
    pub osslsigncode: String,
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from("keys"),
            openssl: "openssl".to_string(),
            osslsigncode: "osslsigncode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Child processes still running after this long are killed
    pub timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self { timeout_secs: 120 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AvailabilityConfig {
    pub max_workers: usize,
}

impl Default for AvailabilityConfig {
    fn default() -> Self {
        Self { max_workers: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Used when `RUST_LOG` is unset
    pub level: String,
    /// Log to this file instead of stderr
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Settings {
    /// Load, apply environment overrides and validate.
    pub fn from_file<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(AppError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path)?;
        let mut settings = Self::from_toml(&contents)?;
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> AppResult<Self> {
        toml::from_str(contents).map_err(|e| AppError::Config(format!("Invalid configuration: {}", e)))
    }

    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            self.directory.password = password;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.directory.url.trim().is_empty() {
            return Err(AppError::Config("directory.url cannot be empty".to_string()));
        }
        if self.directory.connect_timeout_secs == 0 {
            return Err(AppError::Config(
                "directory.connect_timeout_secs must be positive".to_string(),
            ));
        }
        if matches!(&self.directory.controller, Some(c) if c.trim().is_empty()) {
            return Err(AppError::Config("directory.controller cannot be blank".to_string()));
        }
        if self.tools.timeout_secs == 0 {
            return Err(AppError::Config("tools.timeout_secs must be positive".to_string()));
        }
        if self.availability.max_workers == 0 {
            return Err(AppError::Config("availability.max_workers must be positive".to_string()));
        }
        if self.store.tool.trim().is_empty() {
            return Err(AppError::Config("store.tool cannot be empty".to_string()));
        }
        PolicyGuid::parse(&self.store.template_guid)
            .map_err(|_| AppError::Config(format!("store.template_guid is not a GUID: {}", self.store.template_guid)))?;
        Ok(())
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.directory.connect_timeout_secs)
    }

    /// Copy safe to print
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if !copy.directory.password.is_empty() {
            copy.directory.password = "********".to_string();
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.store.strategy, StoreStrategy::Tool);
        assert_eq!(settings.store.tool, "samba-tool");
        assert_eq!(settings.availability.max_workers, 8);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let settings = Settings::from_toml(
            r#"
            [directory]
            url = "ldaps://dc1.example.com"
            controller = "dc1.example.com"

            [store]
            strategy = "direct"
            "#,
        )
        .unwrap();
        assert_eq!(settings.directory.url, "ldaps://dc1.example.com");
        assert_eq!(settings.directory.controller.as_deref(), Some("dc1.example.com"));
        assert_eq!(settings.store.strategy, StoreStrategy::Direct);
        assert_eq!(settings.signing.osslsigncode, "osslsigncode");
        assert_eq!(settings.tools.timeout_secs, 120);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut settings = Settings::default();
        settings.availability.max_workers = 0;
        assert!(matches!(settings.validate(), Err(AppError::Config(_))));

        let mut settings = Settings::default();
        settings.store.template_guid = "not-a-guid".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.directory.controller = Some("  ".to_string());
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_unknown_strategy_is_config_error() {
        let err = Settings::from_toml("[store]\nstrategy = \"magic\"\n").unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_missing_file() {
        let err = Settings::from_file("/nonexistent/gpo-registry.toml").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut settings = Settings::default();
        settings.directory.password = "hunter2".to_string();
        assert_eq!(settings.redacted().directory.password, "********");
    }
}

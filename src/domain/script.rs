use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{AppError, AppResult};

/// Which half of a policy a script belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptScope {
    User,
    Machine,
}

impl ScriptScope {
    /// Directory name under the policy root
    pub fn dir_name(&self) -> &'static str {
        match self {
            ScriptScope::User => "User",
            ScriptScope::Machine => "Machine",
        }
    }

    /// Kinds recorded in this scope's log, in log order
    pub fn kinds(&self) -> &'static [ScriptKind] {
        match self {
            ScriptScope::User => &[ScriptKind::Logon, ScriptKind::Logoff],
            ScriptScope::Machine => &[ScriptKind::Startup, ScriptKind::Shutdown],
        }
    }
}

/// When a script runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScriptKind {
    #[serde(alias = "Login")]
    Logon,
    Logoff,
    Startup,
    Shutdown,
}

/// Client-side extension tokens for script processing.
const USER_SCRIPTS_CSE: &str = "[{42B5FA88-6536-11D2-AE5A-0000F87571E3}]";
const MACHINE_SCRIPTS_CSE: &str = "[{42B5FAAE-6536-11D2-AE5A-0000F87571E3}{40B6664F-4972-11D1-A7CA-0000F87571E3}]";

impl ScriptKind {
    /// Parse kind from string. `Login` is accepted as an alias of `Logon`.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "login" | "logon" => Some(ScriptKind::Logon),
            "logoff" | "logout" => Some(ScriptKind::Logoff),
            "startup" => Some(ScriptKind::Startup),
            "shutdown" => Some(ScriptKind::Shutdown),
            _ => None,
        }
    }

    pub fn parse(s: &str) -> AppResult<Self> {
        Self::from_str(s).ok_or_else(|| AppError::InvalidInput(format!("Invalid script kind: '{}'", s)))
    }

    pub fn scope(&self) -> ScriptScope {
        match self {
            ScriptKind::Logon | ScriptKind::Logoff => ScriptScope::User,
            ScriptKind::Startup | ScriptKind::Shutdown => ScriptScope::Machine,
        }
    }

    /// Section name in the script log, also the script directory name
    pub fn section(&self) -> &'static str {
        match self {
            ScriptKind::Logon => "Logon",
            ScriptKind::Logoff => "Logoff",
            ScriptKind::Startup => "Startup",
            ScriptKind::Shutdown => "Shutdown",
        }
    }

    /// Directory attribute that lists the extensions for this kind's scope
    pub fn extension_attribute(&self) -> &'static str {
        match self.scope() {
            ScriptScope::User => "gPCUserExtensionNames",
            ScriptScope::Machine => "gPCMachineExtensionNames",
        }
    }

    /// Extension token that makes clients run this kind of script
    pub fn extension_token(&self) -> &'static str {
        match self.scope() {
            ScriptScope::User => USER_SCRIPTS_CSE,
            ScriptScope::Machine => MACHINE_SCRIPTS_CSE,
        }
    }

    pub fn all() -> &'static [ScriptKind] {
        &[
            ScriptKind::Logon,
            ScriptKind::Logoff,
            ScriptKind::Startup,
            ScriptKind::Shutdown,
        ]
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

/// One registered script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptEntry {
    pub order: u32,
    pub script: PathBuf,
    pub parameters: String,
}

/// All scripts of a policy grouped by kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyScripts {
    pub login: Vec<ScriptEntry>,
    pub logoff: Vec<ScriptEntry>,
    pub startup: Vec<ScriptEntry>,
    pub shutdown: Vec<ScriptEntry>,
}

impl PolicyScripts {
    pub fn for_kind(&self, kind: ScriptKind) -> &[ScriptEntry] {
        match kind {
            ScriptKind::Logon => &self.login,
            ScriptKind::Logoff => &self.logoff,
            ScriptKind::Startup => &self.startup,
            ScriptKind::Shutdown => &self.shutdown,
        }
    }

    pub fn for_kind_mut(&mut self, kind: ScriptKind) -> &mut Vec<ScriptEntry> {
        match kind {
            ScriptKind::Logon => &mut self.login,
            ScriptKind::Logoff => &mut self.logoff,
            ScriptKind::Startup => &mut self.startup,
            ScriptKind::Shutdown => &mut self.shutdown,
        }
    }
}

/// How a caller identifies a script to remove
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptRef {
    Order(u32),
    Name(String),
}

impl ScriptRef {
    /// Numeric references are order ids, anything else is a file name.
    pub fn parse(value: &str) -> AppResult<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(AppError::InvalidInput("Empty script reference".to_string()));
        }
        if value.chars().all(|c| c.is_ascii_digit()) {
            return value
                .parse::<u32>()
                .map(ScriptRef::Order)
                .map_err(|e| AppError::InvalidInput(format!("Invalid script order '{}': {}", value, e)));
        }
        Ok(ScriptRef::Name(value.to_string()))
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScriptRef::Order(order) => write!(f, "#{}", order),
            ScriptRef::Name(name) => f.write_str(name),
        }
    }
}

/// Script content handed in by a caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// An existing file to copy
    File(PathBuf),
    /// Script text, written to a temporary `.ps1` first
    Inline(String),
}

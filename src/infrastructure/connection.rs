//! Directory session management
//!
//! There is no shared connection. Every logical operation asks the connector
//! for a fresh session, optionally targeted at a single controller, and drops
//! it when done. Credentials stay the same for the process lifetime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use super::directory::{DirectoryService, LdapDirectory, LdapTarget, MemoryDirectory};
use crate::config::Settings;
use crate::error::{AppResult, DirectoryError};

/// Opens directory sessions.
pub trait DirectoryConnector: Send + Sync {
    /// `controller` targets one domain controller by host name; `None` uses the configured URL.
    fn connect(&self, controller: Option<&str>) -> AppResult<Box<dyn DirectoryService>>;
}

/// Rewrite the host part of an LDAP URL, keeping scheme and port.
pub fn controller_url(base_url: &str, host: &str) -> String {
    let (scheme, rest) = base_url.split_once("://").unwrap_or(("ldap", base_url));
    let authority = rest.split('/').next().unwrap_or_default();
    match authority.rsplit_once(':') {
        Some((_, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            format!("{}://{}:{}", scheme, host, port)
        }
        _ => format!("{}://{}", scheme, host),
    }
}

/// Connects over LDAP with the configured credentials.
#[derive(Debug, Clone)]
pub struct LdapConnector {
    target: LdapTarget,
}

impl LdapConnector {
    pub fn new(settings: &Settings) -> Self {
        Self {
            target: LdapTarget {
                url: settings.directory.url.clone(),
                bind_dn: settings.directory.user.clone(),
                password: settings.directory.password.clone(),
                base_dn: settings.directory.base_dn.clone(),
                timeout: settings.connect_timeout(),
            },
        }
    }
}

impl DirectoryConnector for LdapConnector {
    fn connect(&self, controller: Option<&str>) -> AppResult<Box<dyn DirectoryService>> {
        let mut target = self.target.clone();
        if let Some(host) = controller {
            target.url = controller_url(&self.target.url, host);
        }
        Ok(Box::new(LdapDirectory::connect(&target)?))
    }
}

/// Hands out sessions on in-memory directories.
///
/// Each registered controller has its own directory so replication gaps can
/// be simulated; controllers registered as unreachable refuse connections.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    default: MemoryDirectory,
    controllers: Arc<Mutex<HashMap<String, Option<MemoryDirectory>>>>,
}

impl MemoryConnector {
    pub fn new(default: MemoryDirectory) -> Self {
        Self {
            default,
            controllers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_controller(self, host: &str, dir: MemoryDirectory) -> Self {
        self.set_controller(host, Some(dir));
        self
    }

    pub fn with_unreachable(self, host: &str) -> Self {
        self.set_controller(host, None);
        self
    }

    fn set_controller(&self, host: &str, dir: Option<MemoryDirectory>) {
        self.controllers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(host.to_ascii_lowercase(), dir);
    }
}

impl DirectoryConnector for MemoryConnector {
    fn connect(&self, controller: Option<&str>) -> AppResult<Box<dyn DirectoryService>> {
        let Some(host) = controller else {
            return Ok(Box::new(self.default.clone()));
        };
        debug!(controller = host, "Opening in-memory controller session");
        let controllers = self.controllers.lock().unwrap_or_else(|e| e.into_inner());
        match controllers.get(&host.to_ascii_lowercase()) {
            Some(Some(dir)) => Ok(Box::new(dir.clone())),
            _ => Err(DirectoryError::new("connect", host, format!("{} is unreachable", host)).into()),
        }
    }
}

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};

static KEY_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static key pattern"));

/// The three artifacts of a signing key, laid out by convention
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyComponent {
    Private,
    Public,
    Pfx,
}

impl KeyComponent {
    pub fn dir_name(&self) -> &'static str {
        match self {
            KeyComponent::Private => "private",
            KeyComponent::Public => "public",
            KeyComponent::Pfx => "pfx",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            KeyComponent::Private => "key",
            KeyComponent::Public => "crt",
            KeyComponent::Pfx => "pfx",
        }
    }

    /// `<keys_dir>/<dir>/<name>.<ext>`
    pub fn path(&self, keys_dir: &Path, name: &str) -> PathBuf {
        keys_dir
            .join(self.dir_name())
            .join(format!("{}.{}", name, self.extension()))
    }

    pub fn all() -> &'static [KeyComponent] {
        &[KeyComponent::Private, KeyComponent::Public, KeyComponent::Pfx]
    }
}

/// Whichever artifacts exist for one key name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMaterial {
    pub private: Option<PathBuf>,
    pub public: Option<PathBuf>,
    pub pfx: Option<PathBuf>,
}

impl KeyMaterial {
    pub fn get(&self, component: KeyComponent) -> Option<&PathBuf> {
        match component {
            KeyComponent::Private => self.private.as_ref(),
            KeyComponent::Public => self.public.as_ref(),
            KeyComponent::Pfx => self.pfx.as_ref(),
        }
    }

    pub fn set(&mut self, component: KeyComponent, path: PathBuf) {
        match component {
            KeyComponent::Private => self.private = Some(path),
            KeyComponent::Public => self.public = Some(path),
            KeyComponent::Pfx => self.pfx = Some(path),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.private.is_none() && self.public.is_none() && self.pfx.is_none()
    }

    pub fn existing(&self) -> Vec<&PathBuf> {
        KeyComponent::all().iter().filter_map(|c| self.get(*c)).collect()
    }
}

pub fn validate_key_name(name: &str) -> AppResult<()> {
    if KEY_NAME.is_match(name) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "Key name '{}' must start with a letter or underscore and contain only letters, digits and underscores",
            name
        )))
    }
}

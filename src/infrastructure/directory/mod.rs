//! Directory service access
//!
//! The rest of the crate talks to the directory only through
//! [`DirectoryService`]. Two backends exist: [`LdapDirectory`] speaks LDAP to a
//! real domain controller, [`MemoryDirectory`] keeps entries in process and
//! backs offline runs and tests.

pub mod filter;
pub mod ldap;
pub mod memory;
pub mod transaction;

pub use filter::*;
pub use ldap::*;
pub use memory::*;
pub use transaction::*;

use serde::Serialize;
use std::collections::BTreeMap;

use crate::error::AppResult;

/// Attribute name with its full value list, as written by add/modify
pub type AttrValues = Vec<(String, Vec<String>)>;

/// Single-valued attribute helper
pub fn attr(name: &str, value: impl Into<String>) -> (String, Vec<String>) {
    (name.to_string(), vec![value.into()])
}

/// Search depth relative to the base DN
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

/// A directory entry with the attributes that were requested
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub dn: String,
    pub attrs: BTreeMap<String, Vec<String>>,
}

impl DirEntry {
    pub fn new(dn: impl Into<String>) -> Self {
        Self {
            dn: dn.into(),
            attrs: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, name: &str, values: &[&str]) -> Self {
        self.attrs
            .insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
        self
    }

    /// Values of an attribute, matched case-insensitively
    pub fn values(&self, name: &str) -> Option<&[String]> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
    }

    pub fn first(&self, name: &str) -> Option<&str> {
        self.values(name).and_then(|v| v.first()).map(String::as_str)
    }
}

/// Search/add/modify/delete against a directory session.
///
/// Writes that fail surface as `AppError::Directory` carrying the backend
/// error. A search whose base does not exist yields an empty result.
pub trait DirectoryService {
    /// Default naming context of the connected domain, e.g. `DC=example,DC=com`
    fn domain_dn(&self) -> &str;

    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> AppResult<Vec<DirEntry>>;

    fn add(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()>;

    /// Replace each listed attribute. An empty value list clears it.
    fn modify(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()>;

    fn delete(&mut self, dn: &str) -> AppResult<()>;

    /// Read one entry by DN
    fn read(&mut self, dn: &str, attrs: &[&str]) -> AppResult<Option<DirEntry>> {
        Ok(self
            .search(dn, SearchScope::Base, &Filter::Any, attrs)?
            .into_iter()
            .next())
    }

    fn exists(&mut self, dn: &str) -> AppResult<bool> {
        Ok(self.read(dn, &["distinguishedName"])?.is_some())
    }
}

/// Lowercased DN with whitespace around separators removed, for comparisons.
pub fn normalize_dn(dn: &str) -> String {
    dn.split(',')
        .map(|rdn| rdn.trim().to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join(",")
}

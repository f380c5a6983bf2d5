use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{normalize_dn, AttrValues, DirEntry, DirectoryService, Filter, SearchScope};
use crate::error::{AppError, AppResult, DirectoryError};

#[derive(Debug, Default)]
struct MemoryState {
    /// Keyed by normalized DN
    entries: BTreeMap<String, DirEntry>,
    /// Normalized DNs whose writes fail
    failing: HashSet<String>,
}

/// In-process directory. Clones share the same entries.
#[derive(Debug, Clone)]
pub struct MemoryDirectory {
    state: Arc<Mutex<MemoryState>>,
    domain_dn: String,
}

fn generalized_now() -> String {
    Utc::now().format("%Y%m%d%H%M%S.0Z").to_string()
}

fn parent_of(dn: &str) -> Option<&str> {
    dn.split_once(',').map(|(_, parent)| parent)
}

fn write_error(operation: &'static str, dn: &str, message: &str) -> AppError {
    DirectoryError::new(operation, dn, message.to_string()).into()
}

impl MemoryDirectory {
    /// A domain with the System and Policies containers already present.
    pub fn new(domain_dn: &str) -> Self {
        let dir = Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            domain_dn: domain_dn.to_string(),
        };
        dir.insert(DirEntry::new(domain_dn).with("objectClass", &["top", "domain", "domainDNS"]));
        dir.insert(
            DirEntry::new(format!("CN=System,{}", domain_dn)).with("objectClass", &["top", "container"]),
        );
        dir.insert(
            DirEntry::new(format!("CN=Policies,CN=System,{}", domain_dn))
                .with("objectClass", &["top", "container"]),
        );
        dir
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panicking test thread must not poison the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace an entry without any checks.
    pub fn insert(&self, mut entry: DirEntry) {
        if entry.values("distinguishedName").is_none() {
            entry
                .attrs
                .insert("distinguishedName".to_string(), vec![entry.dn.clone()]);
        }
        self.lock().entries.insert(normalize_dn(&entry.dn), entry);
    }

    /// Snapshot of one entry with all attributes
    pub fn entry(&self, dn: &str) -> Option<DirEntry> {
        self.lock().entries.get(&normalize_dn(dn)).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every later write to `dn` fail.
    pub fn fail_writes_to(&self, dn: &str) {
        self.lock().failing.insert(normalize_dn(dn));
    }

    fn check_writable(state: &MemoryState, operation: &'static str, dn: &str) -> AppResult<()> {
        if state.failing.contains(&normalize_dn(dn)) {
            return Err(write_error(operation, dn, "unwillingToPerform"));
        }
        Ok(())
    }
}

fn in_scope(candidate: &str, base: &str, scope: SearchScope) -> bool {
    match scope {
        SearchScope::Base => candidate == base,
        SearchScope::OneLevel => parent_of(candidate) == Some(base),
        SearchScope::Subtree => {
            candidate == base || (candidate.len() > base.len() && candidate.ends_with(&format!(",{}", base)))
        }
    }
}

fn project(entry: &DirEntry, attrs: &[&str]) -> DirEntry {
    if attrs.is_empty() || attrs.contains(&"*") {
        return entry.clone();
    }
    DirEntry {
        dn: entry.dn.clone(),
        attrs: entry
            .attrs
            .iter()
            .filter(|(name, _)| attrs.iter().any(|a| a.eq_ignore_ascii_case(name)))
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect(),
    }
}

impl DirectoryService for MemoryDirectory {
    fn domain_dn(&self) -> &str {
        &self.domain_dn
    }

    fn search(
        &mut self,
        base: &str,
        scope: SearchScope,
        filter: &Filter,
        attrs: &[&str],
    ) -> AppResult<Vec<DirEntry>> {
        let base = normalize_dn(base);
        let state = self.lock();
        if !state.entries.contains_key(&base) {
            return Ok(Vec::new());
        }

        Ok(state
            .entries
            .iter()
            .filter(|(key, _)| in_scope(key, &base, scope))
            .filter(|(_, entry)| filter.matches(entry))
            .map(|(_, entry)| project(entry, attrs))
            .collect())
    }

    fn add(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        let key = normalize_dn(dn);
        let mut state = self.lock();
        Self::check_writable(&state, "add", dn)?;
        if state.entries.contains_key(&key) {
            return Err(write_error("add", dn, "entryAlreadyExists"));
        }
        match parent_of(&key) {
            Some(parent) if state.entries.contains_key(parent) => {}
            _ => return Err(write_error("add", dn, "noSuchObject (parent)")),
        }

        let mut entry = DirEntry::new(dn);
        for (name, values) in attrs {
            if !values.is_empty() {
                entry.attrs.insert(name.clone(), values.clone());
            }
        }
        entry
            .attrs
            .entry("distinguishedName".to_string())
            .or_insert_with(|| vec![dn.to_string()]);
        let now = generalized_now();
        entry.attrs.insert("whenCreated".to_string(), vec![now.clone()]);
        entry.attrs.insert("whenChanged".to_string(), vec![now]);
        state.entries.insert(key, entry);
        Ok(())
    }

    fn modify(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        let mut state = self.lock();
        Self::check_writable(&state, "modify", dn)?;
        let entry = state
            .entries
            .get_mut(&normalize_dn(dn))
            .ok_or_else(|| write_error("modify", dn, "noSuchObject"))?;

        for (name, values) in attrs {
            let existing = entry
                .attrs
                .keys()
                .find(|k| k.eq_ignore_ascii_case(name))
                .cloned();
            if let Some(existing) = existing {
                entry.attrs.remove(&existing);
            }
            if !values.is_empty() {
                entry.attrs.insert(name.clone(), values.clone());
            }
        }
        entry
            .attrs
            .insert("whenChanged".to_string(), vec![generalized_now()]);
        Ok(())
    }

    fn delete(&mut self, dn: &str) -> AppResult<()> {
        let key = normalize_dn(dn);
        let mut state = self.lock();
        Self::check_writable(&state, "delete", dn)?;
        if !state.entries.contains_key(&key) {
            return Err(write_error("delete", dn, "noSuchObject"));
        }
        let suffix = format!(",{}", key);
        if state.entries.keys().any(|k| k.ends_with(&suffix)) {
            return Err(write_error("delete", dn, "notAllowedOnNonLeaf"));
        }
        state.entries.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::directory::attr;

    const DOMAIN: &str = "DC=example,DC=com";

    #[test]
    fn test_search_scopes() {
        let mut dir = MemoryDirectory::new(DOMAIN);
        dir.add("OU=Lab,DC=example,DC=com", &vec![attr("objectClass", "organizationalUnit")])
            .unwrap();
        dir.add("OU=Sub,OU=Lab,DC=example,DC=com", &vec![attr("objectClass", "organizationalUnit")])
            .unwrap();

        let ou = Filter::eq("objectClass", "organizationalUnit");
        let base = dir.search("OU=Lab,DC=example,DC=com", SearchScope::Base, &ou, &[]).unwrap();
        assert_eq!(base.len(), 1);
        let one = dir.search(DOMAIN, SearchScope::OneLevel, &ou, &[]).unwrap();
        assert_eq!(one.len(), 1);
        let sub = dir.search(DOMAIN, SearchScope::Subtree, &ou, &[]).unwrap();
        assert_eq!(sub.len(), 2);
    }

    #[test]
    fn test_missing_base_is_empty() {
        let mut dir = MemoryDirectory::new(DOMAIN);
        let found = dir
            .search("OU=Nowhere,DC=example,DC=com", SearchScope::Subtree, &Filter::Any, &[])
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_write_failures_are_directory_errors() {
        let mut dir = MemoryDirectory::new(DOMAIN);
        let err = dir.delete("OU=Nowhere,DC=example,DC=com").unwrap_err();
        assert_eq!(err.error_code(), "DIRECTORY_ERROR");

        let err = dir.add("OU=A,OU=Missing,DC=example,DC=com", &vec![]).unwrap_err();
        assert!(err.to_string().contains("parent"));

        let err = dir.delete("CN=System,DC=example,DC=com").unwrap_err();
        assert!(err.to_string().contains("notAllowedOnNonLeaf"));
    }

    #[test]
    fn test_modify_replaces_and_clears() {
        let mut dir = MemoryDirectory::new(DOMAIN);
        let dn = "OU=Lab,DC=example,DC=com";
        dir.add(dn, &vec![attr("gPLink", "[LDAP://x;0]")]).unwrap();
        dir.modify(dn, &vec![("GPLINK".to_string(), vec![])]).unwrap();
        assert!(dir.entry(dn).unwrap().values("gPLink").is_none());
    }

    #[test]
    fn test_projection() {
        let mut dir = MemoryDirectory::new(DOMAIN);
        let dn = "OU=Lab,DC=example,DC=com";
        dir.add(dn, &vec![attr("description", "lab"), attr("gPLink", "")]).unwrap();
        let entry = dir.read(dn, &["description"]).unwrap().unwrap();
        assert_eq!(entry.attrs.len(), 1);
        assert_eq!(entry.first("description"), Some("lab"));
    }
}

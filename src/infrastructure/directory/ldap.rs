use ldap3::{LdapConn, LdapConnSettings, Mod, Scope, SearchEntry, SearchResult};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{AttrValues, DirEntry, DirectoryService, Filter, SearchScope};
use crate::error::{AppError, AppResult, DirectoryError};

/// LDAP result code for a search base that does not exist
const NO_SUCH_OBJECT: u32 = 32;

/// Credentials and endpoint for one bind
#[derive(Debug, Clone)]
pub struct LdapTarget {
    pub url: String,
    pub bind_dn: String,
    pub password: String,
    pub base_dn: Option<String>,
    pub timeout: Duration,
}

/// A bound LDAP session. Unbinds on drop.
pub struct LdapDirectory {
    conn: LdapConn,
    url: String,
    domain_dn: String,
}

impl LdapDirectory {
    pub fn connect(target: &LdapTarget) -> AppResult<Self> {
        info!(url = %target.url, "Connecting to directory");
        let settings = LdapConnSettings::new().set_conn_timeout(target.timeout);
        let mut conn = LdapConn::with_settings(settings, &target.url)
            .map_err(|e| DirectoryError::new("connect", &target.url, e))?;

        conn.simple_bind(&target.bind_dn, &target.password)
            .and_then(|r| r.success())
            .map_err(|e| DirectoryError::new("bind", &target.bind_dn, e))?;
        debug!(url = %target.url, "Bind successful");

        let domain_dn = match &target.base_dn {
            Some(dn) => dn.clone(),
            None => Self::default_naming_context(&mut conn, &target.url)?,
        };

        Ok(Self {
            conn,
            url: target.url.clone(),
            domain_dn,
        })
    }

    /// Read `defaultNamingContext` from the root DSE
    fn default_naming_context(conn: &mut LdapConn, url: &str) -> AppResult<String> {
        let (entries, _) = conn
            .search("", Scope::Base, "(objectClass=*)", vec!["defaultNamingContext"])
            .and_then(|r| r.success())
            .map_err(|e| DirectoryError::new("search", "rootDSE", e))?;

        entries
            .into_iter()
            .next()
            .map(SearchEntry::construct)
            .and_then(|e| e.attrs.get("defaultNamingContext").and_then(|v| v.first().cloned()))
            .ok_or_else(|| AppError::Config(format!("{} did not report a default naming context", url)))
    }
}

fn to_ldap_scope(scope: SearchScope) -> Scope {
    match scope {
        SearchScope::Base => Scope::Base,
        SearchScope::OneLevel => Scope::OneLevel,
        SearchScope::Subtree => Scope::Subtree,
    }
}

fn value_set(values: &[String]) -> HashSet<String> {
    values.iter().cloned().collect()
}

impl DirectoryService for LdapDirectory {
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
        let filter = filter.to_string();
        debug!(base, filter = %filter, "LDAP search");

        let SearchResult(entries, result) = self
            .conn
            .search(base, to_ldap_scope(scope), &filter, attrs.to_vec())
            .map_err(|e| DirectoryError::new("search", base, e))?;

        if result.rc == NO_SUCH_OBJECT {
            return Ok(Vec::new());
        }
        result
            .success()
            .map_err(|e| DirectoryError::new("search", base, e))?;

        Ok(entries
            .into_iter()
            .map(|raw| {
                let entry = SearchEntry::construct(raw);
                DirEntry {
                    dn: entry.dn,
                    attrs: entry.attrs.into_iter().collect(),
                }
            })
            .collect())
    }

    fn add(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        let attrs: Vec<(String, HashSet<String>)> = attrs
            .iter()
            .map(|(name, values)| (name.clone(), value_set(values)))
            .collect();

        self.conn
            .add(dn, attrs)
            .and_then(|r| r.success())
            .map_err(|e| DirectoryError::new("add", dn, e))?;
        Ok(())
    }

    fn modify(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        let mods: Vec<Mod<String>> = attrs
            .iter()
            .map(|(name, values)| Mod::Replace(name.clone(), value_set(values)))
            .collect();

        self.conn
            .modify(dn, mods)
            .and_then(|r| r.success())
            .map_err(|e| DirectoryError::new("modify", dn, e))?;
        Ok(())
    }

    fn delete(&mut self, dn: &str) -> AppResult<()> {
        self.conn
            .delete(dn)
            .and_then(|r| r.success())
            .map_err(|e| DirectoryError::new("delete", dn, e))?;
        Ok(())
    }
}

impl Drop for LdapDirectory {
    fn drop(&mut self) {
        if let Err(e) = self.conn.unbind() {
            warn!(url = %self.url, error = %e, "Unbind failed");
        }
    }
}

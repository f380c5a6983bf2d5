//! Container link management
//!
//! A container's `gPLink` attribute is a concatenation of
//! `[LDAP://<policy-dn>;<flags>]` tokens, one per linked policy.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use super::availability::AvailabilityChecker;
use super::directory::{normalize_dn, AttrValues, DirectoryService, Filter, SearchScope};
use crate::domain::{policy_dn, PolicyGuid, GP_LINK_ATTR};
use crate::error::{AppError, AppResult};

static LINK_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[LDAP://([^;\]]+);(\d+)\]").expect("static link pattern"));

/// One entry of a `gPLink` value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkToken {
    pub dn: String,
    pub flags: u32,
}

impl LinkToken {
    pub fn new(dn: impl Into<String>) -> Self {
        Self { dn: dn.into(), flags: 0 }
    }

    pub fn refers_to(&self, dn: &str) -> bool {
        normalize_dn(&self.dn) == normalize_dn(dn)
    }
}

pub fn parse_links(value: &str) -> Vec<LinkToken> {
    LINK_TOKEN
        .captures_iter(value)
        .map(|c| LinkToken {
            dn: c[1].trim().to_string(),
            flags: c[2].parse().unwrap_or(0),
        })
        .collect()
}

/// `value` with every token for `dn` cut out and all other text left as is.
/// `None` when no token refers to `dn`.
pub fn remove_links(value: &str, dn: &str) -> Option<String> {
    let mut kept = String::with_capacity(value.len());
    let mut last = 0;
    for c in LINK_TOKEN.captures_iter(value) {
        if !LinkToken::new(c[1].trim()).refers_to(dn) {
            continue;
        }
        let whole = c.get(0)?;
        kept.push_str(&value[last..whole.start()]);
        last = whole.end();
    }
    if last == 0 {
        return None;
    }
    kept.push_str(&value[last..]);
    Some(kept.trim().to_string())
}

pub fn render_links(tokens: &[LinkToken]) -> String {
    tokens
        .iter()
        .map(|t| format!("[LDAP://{};{}]", t.dn, t.flags))
        .collect()
}

/// Links and unlinks one policy on a directory session.
///
/// When a gate is given, every mutation first requires the policy to be
/// consistent across controllers.
pub struct LinkManager<'a> {
    dir: &'a mut dyn DirectoryService,
    gate: Option<&'a AvailabilityChecker>,
}

impl<'a> LinkManager<'a> {
    pub fn new(dir: &'a mut dyn DirectoryService, gate: Option<&'a AvailabilityChecker>) -> Self {
        Self { dir, gate }
    }

    fn check_gate(&self, guid: &PolicyGuid) -> AppResult<()> {
        match self.gate {
            Some(checker) => checker.ensure_consistent(guid),
            None => Ok(()),
        }
    }

    /// DN of the policy, `NotFound` if it does not exist.
    fn existing_policy(&mut self, guid: &PolicyGuid) -> AppResult<String> {
        let dn = policy_dn(guid, self.dir.domain_dn());
        if !self.dir.exists(&dn)? {
            return Err(AppError::NotFound(format!("Policy {} not found", guid)));
        }
        Ok(dn)
    }

    /// Current raw `gPLink` value, `NotFound` if the container does not exist.
    fn container_links(&mut self, container: &str) -> AppResult<String> {
        if container.trim().is_empty() {
            return Err(AppError::InvalidInput("Container DN cannot be empty".to_string()));
        }
        let entry = self
            .dir
            .read(container, &[GP_LINK_ATTR])?
            .ok_or_else(|| AppError::NotFound(format!("Container {} not found", container)))?;
        Ok(entry.first(GP_LINK_ATTR).unwrap_or_default().to_string())
    }

    fn write_links(&mut self, container: &str, value: String) -> AppResult<()> {
        let values = if value.is_empty() { Vec::new() } else { vec![value] };
        let change: AttrValues = vec![(GP_LINK_ATTR.to_string(), values)];
        self.dir.modify(container, &change)
    }

    fn link_unchecked(&mut self, guid: &PolicyGuid, container: &str) -> AppResult<()> {
        let current = self.container_links(container)?;
        let dn = self.existing_policy(guid)?;

        if parse_links(&current).iter().any(|t| t.refers_to(&dn)) {
            return Err(AppError::AlreadyExists(format!(
                "Policy {} is already linked to {}",
                guid, container
            )));
        }

        let updated = format!("{}{}", current, render_links(&[LinkToken::new(dn)]));
        self.write_links(container, updated)?;
        info!(policy = %guid, container, "Policy linked");
        Ok(())
    }

    fn unlink_unchecked(&mut self, guid: &PolicyGuid, container: &str) -> AppResult<()> {
        let current = self.container_links(container)?;
        let dn = self.existing_policy(guid)?;

        let remaining = remove_links(&current, &dn).ok_or_else(|| {
            AppError::AlreadyExists(format!("Policy {} is not linked to {}", guid, container))
        })?;

        self.write_links(container, remaining)?;
        info!(policy = %guid, container, "Policy unlinked");
        Ok(())
    }

    pub fn link_single(&mut self, guid: &PolicyGuid, container: &str) -> AppResult<()> {
        self.check_gate(guid)?;
        self.link_unchecked(guid, container)
    }

    pub fn unlink_single(&mut self, guid: &PolicyGuid, container: &str) -> AppResult<()> {
        self.check_gate(guid)?;
        self.unlink_unchecked(guid, container)
    }

    /// Link to every container, skipping those already linked. Returns the newly linked ones.
    pub fn link(&mut self, guid: &PolicyGuid, containers: &[String]) -> AppResult<Vec<String>> {
        self.check_gate(guid)?;
        let mut linked = Vec::new();
        for container in containers {
            match self.link_unchecked(guid, container) {
                Ok(()) => linked.push(container.clone()),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(linked)
    }

    /// Unlink from the given containers, or from every linked container when `None`.
    pub fn unlink(&mut self, guid: &PolicyGuid, containers: Option<&[String]>) -> AppResult<Vec<String>> {
        self.check_gate(guid)?;
        let targets = match containers {
            Some(list) => list.to_vec(),
            None => self.linked_to(guid)?,
        };

        let mut unlinked = Vec::new();
        for container in &targets {
            match self.unlink_unchecked(guid, container) {
                Ok(()) => unlinked.push(container.clone()),
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e),
            }
        }
        if containers.is_none() && unlinked.len() != targets.len() {
            warn!(policy = %guid, "Some containers were unlinked concurrently");
        }
        Ok(unlinked)
    }

    /// Containers whose `gPLink` references the policy.
    pub fn linked_to(&mut self, guid: &PolicyGuid) -> AppResult<Vec<String>> {
        linked_to(&mut *self.dir, guid)
    }
}

/// Reverse lookup of every container linking `guid`.
pub fn linked_to(dir: &mut dyn DirectoryService, guid: &PolicyGuid) -> AppResult<Vec<String>> {
    let domain_dn = dir.domain_dn().to_string();
    let dn = policy_dn(guid, &domain_dn);
    let filter = Filter::And(vec![
        Filter::present(GP_LINK_ATTR),
        Filter::contains(GP_LINK_ATTR, guid.as_str()),
    ]);

    Ok(dir
        .search(&domain_dn, SearchScope::Subtree, &filter, &[GP_LINK_ATTR])?
        .into_iter()
        .filter(|entry| {
            entry
                .first(GP_LINK_ATTR)
                .map(|value| parse_links(value).iter().any(|t| t.refers_to(&dn)))
                .unwrap_or(false)
        })
        .map(|entry| entry.dn)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::directory::{DirEntry, MemoryDirectory};

    const DOMAIN: &str = "DC=example,DC=com";
    const LAB: &str = "OU=Lab,DC=example,DC=com";
    const OPS: &str = "OU=Ops,DC=example,DC=com";

    fn setup() -> (MemoryDirectory, PolicyGuid) {
        let dir = MemoryDirectory::new(DOMAIN);
        let guid = PolicyGuid::parse("{6AC1786C-016F-11D2-945F-00C04FB984F9}").unwrap();
        dir.insert(DirEntry::new(policy_dn(&guid, DOMAIN)).with("objectClass", &["groupPolicyContainer"]));
        dir.insert(DirEntry::new(LAB).with("objectClass", &["organizationalUnit"]));
        dir.insert(
            DirEntry::new(OPS)
                .with("objectClass", &["organizationalUnit"])
                .with("gPLink", &["[LDAP://cn={AAAAAAAA-0000-0000-0000-000000000000},cn=policies,cn=system,DC=example,DC=com;1]"]),
        );
        (dir, guid)
    }

    #[test]
    fn test_parse_and_render() {
        let value = "[LDAP://CN={A},CN=Policies,DC=x;0][ldap://CN={B},CN=Policies,DC=x;2]";
        let tokens = parse_links(value);
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].flags, 2);
        assert_eq!(render_links(&tokens[..1]), "[LDAP://CN={A},CN=Policies,DC=x;0]");
        assert!(parse_links("").is_empty());
    }

    #[test]
    fn test_link_twice_is_already_exists_and_unchanged() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        let mut links = LinkManager::new(&mut session, None);
        links.link_single(&guid, LAB).unwrap();
        let before = dir.entry(LAB).unwrap().first("gPLink").map(str::to_string);

        let err = links.link_single(&guid, LAB).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(dir.entry(LAB).unwrap().first("gPLink").map(str::to_string), before);
    }

    #[test]
    fn test_link_appends_after_existing_tokens() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        LinkManager::new(&mut session, None).link_single(&guid, OPS).unwrap();
        let value = dir.entry(OPS).unwrap().first("gPLink").unwrap().to_string();
        let tokens = parse_links(&value);
        assert_eq!(tokens.len(), 2);
        assert!(tokens[1].refers_to(&policy_dn(&guid, DOMAIN)));
        assert_eq!(tokens[0].flags, 1);
    }

    #[test]
    fn test_unlink_never_linked() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        let err = LinkManager::new(&mut session, None).unlink_single(&guid, OPS).unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(parse_links(dir.entry(OPS).unwrap().first("gPLink").unwrap()).len(), 1);
    }

    #[test]
    fn test_unlink_last_token_clears_value() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        let mut links = LinkManager::new(&mut session, None);
        links.link_single(&guid, LAB).unwrap();
        links.unlink_single(&guid, LAB).unwrap();
        assert!(dir.entry(LAB).unwrap().first("gPLink").is_none());
    }

    #[test]
    fn test_unlink_keeps_text_it_cannot_parse() {
        let (dir, guid) = setup();
        let dn = policy_dn(&guid, DOMAIN).to_uppercase();
        let original = format!("[LDAP://cn=other;0] legacy-junk[LDAP://{};0][LDAP://cn=bad;x]", dn);
        dir.insert(
            DirEntry::new(LAB)
                .with("objectClass", &["organizationalUnit"])
                .with("gPLink", &[original.as_str()]),
        );

        let mut session = dir.clone();
        LinkManager::new(&mut session, None).unlink_single(&guid, LAB).unwrap();
        assert_eq!(
            dir.entry(LAB).unwrap().first("gPLink").unwrap(),
            "[LDAP://cn=other;0] legacy-junk[LDAP://cn=bad;x]"
        );
        assert_eq!(remove_links("[LDAP://cn=other;0]", &dn), None);
    }

    #[test]
    fn test_missing_policy_or_container() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        let mut links = LinkManager::new(&mut session, None);
        let err = links.link_single(&guid, "OU=Gone,DC=example,DC=com").unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        let other = PolicyGuid::generate();
        assert_eq!(links.link_single(&other, LAB).unwrap_err().error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_bulk_calls_are_idempotent() {
        let (dir, guid) = setup();
        let mut session = dir.clone();
        let mut links = LinkManager::new(&mut session, None);
        let all = vec![LAB.to_string(), OPS.to_string()];
        assert_eq!(links.link(&guid, &all[..1]).unwrap().len(), 1);
        assert_eq!(links.link(&guid, &all).unwrap(), vec![OPS.to_string()]);

        let mut found = links.linked_to(&guid).unwrap();
        found.sort();
        assert_eq!(found, vec![LAB.to_string(), OPS.to_string()]);

        assert_eq!(links.unlink(&guid, None).unwrap().len(), 2);
        assert!(links.linked_to(&guid).unwrap().is_empty());
        assert!(links.unlink(&guid, Some(&all)).unwrap().is_empty());
        // The foreign link on Ops survives.
        assert_eq!(parse_links(dir.entry(OPS).unwrap().first("gPLink").unwrap()).len(), 1);
    }
}

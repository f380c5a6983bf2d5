//! Group Policy lifecycle operations
//!
//! [`GpoService`] is what callers talk to. It validates input, applies the
//! replication gate when no controller is pinned, and delegates to the link
//! manager, the script registry and the policy store.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::domain::{
    local_policy_path, parse_generalized_time, policies_container_dn, policy_dn, realm_from_dn,
    unc_policy_path, validate_safe, PolicyGuid, PolicyObject, PolicyScripts, ScriptEntry,
    ScriptKind, ScriptRef, ScriptSource, POLICY_ATTRS, POLICY_OBJECT_CLASS,
};
use crate::error::{AppError, AppResult};
use crate::infrastructure::{
    linked_to, policy_store, AvailabilityChecker, CertificateManager, DirEntry, DirectoryConnector,
    DirectoryService, Filter, LdapConnector, LinkManager, PolicyStore, ScriptRegistry, SearchScope,
    ToolRunner,
};

/// Entry point for every policy operation.
pub struct GpoService {
    connector: Arc<dyn DirectoryConnector>,
    checker: AvailabilityChecker,
    store: Arc<dyn PolicyStore>,
    certificates: CertificateManager,
    sysvol_root: PathBuf,
    controller: Option<String>,
}

impl GpoService {
    /// Service talking LDAP to the configured directory.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings, Arc::new(LdapConnector::new(settings)))
    }

    pub fn new(settings: &Settings, connector: Arc<dyn DirectoryConnector>) -> Self {
        let runner = ToolRunner::new(settings.tool_timeout());
        Self {
            checker: AvailabilityChecker::new(connector.clone(), settings.availability.max_workers),
            store: policy_store(settings, runner.clone()),
            certificates: CertificateManager::new(&settings.signing, runner),
            connector,
            sysvol_root: settings.sysvol.root.clone(),
            controller: settings.directory.controller.clone(),
        }
    }

    /// Replace the configured store.
    pub fn with_store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.store = store;
        self
    }

    pub fn certificates(&self) -> &CertificateManager {
        &self.certificates
    }

    fn session(&self) -> AppResult<Box<dyn DirectoryService>> {
        self.connector.connect(self.controller.as_deref())
    }

    /// The replication gate, off when pinned to one controller.
    fn gate(&self) -> Option<&AvailabilityChecker> {
        match self.controller {
            Some(_) => None,
            None => Some(&self.checker),
        }
    }

    fn ensure_consistent(&self, guid: &PolicyGuid) -> AppResult<()> {
        match self.gate() {
            Some(checker) => checker.ensure_consistent(guid),
            None => Ok(()),
        }
    }

    fn to_policy(&self, dir: &mut dyn DirectoryService, entry: &DirEntry) -> AppResult<PolicyObject> {
        let guid_text = entry
            .first("name")
            .map(str::to_string)
            .or_else(|| {
                entry
                    .dn
                    .split(',')
                    .next()
                    .and_then(|rdn| rdn.trim().get(3..))
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let guid = PolicyGuid::parse(&guid_text)?;
        let realm = realm_from_dn(dir.domain_dn());
        let number = |attr: &str| entry.first(attr).and_then(|v| v.trim().parse::<u32>().ok()).unwrap_or(0);

        Ok(PolicyObject {
            name: entry.first("displayName").unwrap_or_default().to_string(),
            dn: entry.dn.clone(),
            path: entry.first("gPCFileSysPath").unwrap_or_default().to_string(),
            local_path: local_policy_path(&self.sysvol_root, &realm, &guid),
            version: number("versionNumber"),
            user_extension_names: entry.first("gPCUserExtensionNames").unwrap_or_default().to_string(),
            machine_extension_names: entry.first("gPCMachineExtensionNames").unwrap_or_default().to_string(),
            functionality_version: number("gPCFunctionalityVersion"),
            created_at: entry.first("whenCreated").and_then(parse_generalized_time),
            updated_at: entry.first("whenChanged").and_then(parse_generalized_time),
            linked_to: linked_to(dir, &guid)?,
            guid,
        })
    }

    fn read_policy(&self, dir: &mut dyn DirectoryService, guid: &PolicyGuid) -> AppResult<PolicyObject> {
        let dn = policy_dn(guid, dir.domain_dn());
        let entry = dir
            .read(&dn, POLICY_ATTRS)?
            .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", guid)))?;
        self.to_policy(dir, &entry)
    }

    /// All policies, sorted by display name.
    pub fn list(&self) -> AppResult<Vec<PolicyObject>> {
        let mut dir = self.session()?;
        let base = policies_container_dn(dir.domain_dn());
        let entries = dir.search(
            &base,
            SearchScope::OneLevel,
            &Filter::eq("objectClass", POLICY_OBJECT_CLASS),
            POLICY_ATTRS,
        )?;

        let mut policies = entries
            .iter()
            .map(|entry| self.to_policy(dir.as_mut(), entry))
            .collect::<AppResult<Vec<_>>>()?;
        policies.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
        debug!(count = policies.len(), "Policies listed");
        Ok(policies)
    }

    pub fn get(&self, id: &str) -> AppResult<PolicyObject> {
        let guid = PolicyGuid::parse(id)?;
        let mut dir = self.session()?;
        self.read_policy(dir.as_mut(), &guid)
    }

    /// Create a policy and link it to `containers`.
    pub fn create(&self, name: &str, containers: &[String]) -> AppResult<PolicyObject> {
        validate_safe(name, "Name")?;
        let mut dir = self.session()?;

        let base = policies_container_dn(dir.domain_dn());
        let filter = Filter::And(vec![
            Filter::eq("objectClass", POLICY_OBJECT_CLASS),
            Filter::eq("displayName", name),
        ]);
        if !dir.search(&base, SearchScope::OneLevel, &filter, &["displayName"])?.is_empty() {
            return Err(AppError::AlreadyExists(format!("A policy named {} already exists", name)));
        }

        let guid = self.store.create(dir.as_mut(), name)?;
        info!(policy = %guid, name, strategy = ?self.store.strategy(), "Policy created");

        let dn = policy_dn(&guid, dir.domain_dn());
        if !dir.exists(&dn)? {
            warn!(
                policy = %guid,
                skipped_links = containers.len(),
                "Policy not yet visible to this session, links not applied"
            );
            return Ok(self.pending_policy(dir.domain_dn(), guid, name));
        }
        if !containers.is_empty() {
            // Same session that created the policy, so no replication gap to guard against.
            LinkManager::new(dir.as_mut(), None).link(&guid, containers)?;
        }
        self.read_policy(dir.as_mut(), &guid)
    }

    /// Record for a policy the store reported as created but the directory cannot show yet.
    fn pending_policy(&self, domain_dn: &str, guid: PolicyGuid, name: &str) -> PolicyObject {
        let realm = realm_from_dn(domain_dn);
        PolicyObject {
            name: name.to_string(),
            dn: policy_dn(&guid, domain_dn),
            path: unc_policy_path(&realm, &guid),
            local_path: local_policy_path(&self.sysvol_root, &realm, &guid),
            version: 0,
            user_extension_names: String::new(),
            machine_extension_names: String::new(),
            functionality_version: 2,
            created_at: None,
            updated_at: None,
            linked_to: Vec::new(),
            guid,
        }
    }

    /// Unlink the policy everywhere, then remove it.
    pub fn delete(&self, id: &str) -> AppResult<()> {
        let guid = PolicyGuid::parse(id)?;
        self.ensure_consistent(&guid)?;
        let mut dir = self.session()?;
        let policy = self.read_policy(dir.as_mut(), &guid)?;

        LinkManager::new(dir.as_mut(), None).unlink(&guid, None)?;
        self.store.delete(dir.as_mut(), &policy)?;
        info!(policy = %guid, "Policy deleted");
        Ok(())
    }

    /// Link to each container, skipping those already linked.
    pub fn link(&self, id: &str, containers: &[String]) -> AppResult<Vec<String>> {
        let guid = PolicyGuid::parse(id)?;
        let mut dir = self.session()?;
        LinkManager::new(dir.as_mut(), self.gate()).link(&guid, containers)
    }

    /// Unlink from each container, or from all of them when `None`.
    pub fn unlink(&self, id: &str, containers: Option<&[String]>) -> AppResult<Vec<String>> {
        let guid = PolicyGuid::parse(id)?;
        let mut dir = self.session()?;
        LinkManager::new(dir.as_mut(), self.gate()).unlink(&guid, containers)
    }

    pub fn add_script(
        &self,
        id: &str,
        kind: &str,
        source: ScriptSource,
        parameters: &str,
    ) -> AppResult<ScriptEntry> {
        let guid = PolicyGuid::parse(id)?;
        let kind = ScriptKind::parse(kind)?;
        self.ensure_consistent(&guid)?;

        let mut dir = self.session()?;
        let policy = self.read_policy(dir.as_mut(), &guid)?;
        if !policy.local_path.is_dir() {
            return Err(AppError::FileOperationFailed(format!(
                "Policy directory {} is missing",
                policy.local_path.display()
            )));
        }

        // Inline text lives in a temp file until it has been copied.
        let mut inline = None;
        let path = match source {
            ScriptSource::File(path) => path,
            ScriptSource::Inline(text) => {
                let mut file = tempfile::Builder::new()
                    .prefix("script-")
                    .suffix(".ps1")
                    .tempfile()
                    .map_err(|e| AppError::file("Cannot create temporary script", e))?;
                file.write_all(text.as_bytes())
                    .map_err(|e| AppError::file("Cannot write temporary script", e))?;
                let path = file.path().to_path_buf();
                inline = Some(file);
                path
            }
        };

        let registry = ScriptRegistry::new(&policy.local_path);
        let entry = registry.add(dir.as_mut(), &policy.dn, kind, &path, parameters)?;
        drop(inline);
        Ok(entry)
    }

    /// Remove a script by order id or file name. Returns the removed order id.
    pub fn delete_script(&self, id: &str, kind: &str, script: &str) -> AppResult<u32> {
        let guid = PolicyGuid::parse(id)?;
        let kind = ScriptKind::parse(kind)?;
        let script = ScriptRef::parse(script)?;
        self.ensure_consistent(&guid)?;

        let mut dir = self.session()?;
        let policy = self.read_policy(dir.as_mut(), &guid)?;
        ScriptRegistry::new(&policy.local_path).delete(kind, &script)
    }

    pub fn list_scripts(&self, id: &str) -> AppResult<PolicyScripts> {
        let guid = PolicyGuid::parse(id)?;
        let mut dir = self.session()?;
        let policy = self.read_policy(dir.as_mut(), &guid)?;
        ScriptRegistry::new(&policy.local_path).list()
    }

    pub fn integrity(&self, id: &str) -> AppResult<bool> {
        self.checker.integrity(&PolicyGuid::parse(id)?)
    }

    pub fn availability(&self, id: &str) -> AppResult<BTreeMap<String, bool>> {
        self.checker.availability(&PolicyGuid::parse(id)?)
    }
}

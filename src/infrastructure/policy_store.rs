//! Policy creation and deletion strategies
//!
//! [`ToolPolicyStore`] hands the work to the domain's policy tool.
//! [`DirectPolicyStore`] writes the directory entries inside a transaction
//! and builds the policy directory skeleton itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::connection::controller_url;
use super::directory::{attr, AttrValues, DirectoryService, Transaction};
use super::permissions::align_tree;
use super::tool_runner::ToolRunner;
use crate::config::{Settings, StoreStrategy};
use crate::domain::{
    local_policy_path, policy_dn, realm_from_dn, unc_policy_path, PolicyGuid, PolicyObject, POLICY_OBJECT_CLASS,
};
use crate::error::{AppError, AppResult};

/// Contents of a fresh `GPT.INI`
pub const GPT_INI: &str = "[General]\r\nVersion=0\r\n";

/// Creates and deletes policy objects.
pub trait PolicyStore: Send + Sync {
    fn strategy(&self) -> StoreStrategy;

    /// Create a policy named `name` and return its GUID.
    fn create(&self, dir: &mut dyn DirectoryService, name: &str) -> AppResult<PolicyGuid>;

    /// Remove the policy's directory entries and files. Links are already gone.
    fn delete(&self, dir: &mut dyn DirectoryService, policy: &PolicyObject) -> AppResult<()>;
}

/// The store selected by `store.strategy`
pub fn policy_store(settings: &Settings, runner: ToolRunner) -> Arc<dyn PolicyStore> {
    match settings.store.strategy {
        StoreStrategy::Tool => Arc::new(ToolPolicyStore::new(settings, runner)),
        StoreStrategy::Direct => Arc::new(DirectPolicyStore::new(settings)),
    }
}

/// Delegates to `samba-tool gpo create|del`.
pub struct ToolPolicyStore {
    program: String,
    user: String,
    password: String,
    /// Same host the directory sessions use, so the new policy is readable right away
    host_url: String,
    runner: ToolRunner,
}

impl ToolPolicyStore {
    pub fn new(settings: &Settings, runner: ToolRunner) -> Self {
        Self {
            program: settings.store.tool.clone(),
            user: settings.directory.user.clone(),
            password: settings.directory.password.clone(),
            host_url: match &settings.directory.controller {
                Some(host) => controller_url(&settings.directory.url, host),
                None => settings.directory.url.clone(),
            },
            runner,
        }
    }

    /// Credentials go on stdin, never on the command line.
    fn run(&self, verb: &str, target: &str) -> AppResult<String> {
        let args = [
            "gpo",
            verb,
            target,
            "-U",
            self.user.as_str(),
            "-H",
            self.host_url.as_str(),
        ];
        let stdin = format!("{}\n", self.password);
        Ok(self.runner.run(&self.program, &args, Some(&stdin))?.stdout)
    }
}

impl PolicyStore for ToolPolicyStore {
    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Tool
    }

    fn create(&self, _dir: &mut dyn DirectoryService, name: &str) -> AppResult<PolicyGuid> {
        let stdout = self.run("create", name)?;
        let guid = PolicyGuid::find_in(&stdout).ok_or_else(|| AppError::ExternalToolFailed {
            tool: self.program.clone(),
            exit_code: Some(0),
            stderr: format!("no GUID in output: {}", stdout.trim()),
        })?;
        info!(policy = %guid, name, "Policy created by tool");
        Ok(guid)
    }

    fn delete(&self, _dir: &mut dyn DirectoryService, policy: &PolicyObject) -> AppResult<()> {
        self.run("del", policy.guid.as_str())?;
        info!(policy = %policy.guid, "Policy deleted by tool");
        Ok(())
    }
}

/// Writes directory entries and the policy skeleton directly.
pub struct DirectPolicyStore {
    sysvol_root: PathBuf,
    template: String,
}

impl DirectPolicyStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            sysvol_root: settings.sysvol.root.clone(),
            template: settings.store.template_guid.clone(),
        }
    }

    fn create_skeleton(path: &Path) -> AppResult<()> {
        std::fs::create_dir(path).map_err(|e| AppError::file(format!("Cannot create {}", path.display()), e))?;
        for sub in ["Machine", "User"] {
            std::fs::create_dir(path.join(sub))
                .map_err(|e| AppError::file(format!("Cannot create {}/{}", path.display(), sub), e))?;
        }
        std::fs::write(path.join("GPT.INI"), GPT_INI)
            .map_err(|e| AppError::file(format!("Cannot write {}/GPT.INI", path.display()), e))
    }

    fn write_entries(dir: &mut dyn DirectoryService, dn: &str, name: &str, unc_path: &str) -> AppResult<()> {
        let mut tx = Transaction::begin(dir);
        let policy: AttrValues = vec![
            attr("objectClass", POLICY_OBJECT_CLASS),
            attr("displayName", name),
            attr("gPCFileSysPath", unc_path),
            attr("versionNumber", "0"),
            attr("gPCFunctionalityVersion", "2"),
            attr("flags", "0"),
        ];
        tx.add(dn, &policy)?;
        tx.add(&format!("CN=User,{}", dn), &vec![attr("objectClass", "container")])?;
        tx.add(&format!("CN=Machine,{}", dn), &vec![attr("objectClass", "container")])?;
        tx.commit();
        Ok(())
    }
}

impl PolicyStore for DirectPolicyStore {
    fn strategy(&self) -> StoreStrategy {
        StoreStrategy::Direct
    }

    fn create(&self, dir: &mut dyn DirectoryService, name: &str) -> AppResult<PolicyGuid> {
        let domain_dn = dir.domain_dn().to_string();
        let realm = realm_from_dn(&domain_dn);

        let template = PolicyGuid::parse(&self.template)?;
        let template_path = local_policy_path(&self.sysvol_root, &realm, &template);
        if !dir.exists(&policy_dn(&template, &domain_dn))? || !template_path.is_dir() {
            return Err(AppError::NotFound(format!("Template policy {} not found", template)));
        }

        let guid = PolicyGuid::generate();
        let path = local_policy_path(&self.sysvol_root, &realm, &guid);
        let dn = policy_dn(&guid, &domain_dn);

        Self::create_skeleton(&path)?;
        if let Err(e) = Self::write_entries(dir, &dn, name, &unc_policy_path(&realm, &guid)) {
            error!(policy = %guid, error = %e, "Directory write failed, removing policy files");
            if let Err(cleanup) = std::fs::remove_dir_all(&path) {
                warn!(path = %path.display(), error = %cleanup, "Could not remove policy files");
            }
            return Err(e);
        }

        align_tree(&template_path, &path)?;
        info!(policy = %guid, name, "Policy created");
        Ok(guid)
    }

    fn delete(&self, dir: &mut dyn DirectoryService, policy: &PolicyObject) -> AppResult<()> {
        let mut tx = Transaction::begin(dir);
        for child in ["User", "Machine"] {
            let child_dn = format!("CN={},{}", child, policy.dn);
            if tx.directory().exists(&child_dn)? {
                tx.delete(&child_dn)?;
            }
        }
        tx.delete(&policy.dn)?;
        tx.commit();

        match std::fs::remove_dir_all(&policy.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(AppError::file(
                    format!("Cannot remove {}", policy.local_path.display()),
                    e,
                ))
            }
        }
        info!(policy = %policy.guid, "Policy deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_TEMPLATE_GUID;
    use crate::infrastructure::directory::{DirEntry, MemoryDirectory};

    const DOMAIN: &str = "DC=example,DC=com";

    fn direct_setup() -> (tempfile::TempDir, MemoryDirectory, DirectPolicyStore) {
        let tmp = tempfile::tempdir().unwrap();
        let template = PolicyGuid::parse(DEFAULT_TEMPLATE_GUID).unwrap();
        std::fs::create_dir_all(local_policy_path(tmp.path(), "example.com", &template)).unwrap();
        let dir = MemoryDirectory::new(DOMAIN);
        dir.insert(DirEntry::new(policy_dn(&template, DOMAIN)).with("objectClass", &[POLICY_OBJECT_CLASS]));

        let mut settings = Settings::default();
        settings.sysvol.root = tmp.path().to_path_buf();
        settings.store.strategy = StoreStrategy::Direct;
        (tmp, dir, DirectPolicyStore::new(&settings))
    }

    #[test]
    fn test_direct_create_writes_entries_and_skeleton() {
        let (tmp, dir, store) = direct_setup();
        let mut session = dir.clone();
        let guid = store.create(&mut session, "Lab").unwrap();

        let entry = dir.entry(&policy_dn(&guid, DOMAIN)).unwrap();
        assert_eq!(entry.first("displayName"), Some("Lab"));
        assert_eq!(entry.first("versionNumber"), Some("0"));
        assert!(dir.entry(&format!("CN=Machine,{}", policy_dn(&guid, DOMAIN))).is_some());

        let path = local_policy_path(tmp.path(), "example.com", &guid);
        assert_eq!(std::fs::read_to_string(path.join("GPT.INI")).unwrap(), GPT_INI);
        assert!(path.join("User").is_dir());
    }

    #[test]
    fn test_direct_create_cleans_up_on_directory_failure() {
        let (tmp, dir, store) = direct_setup();
        let before = dir.len();
        let mut failing = FailingSecondAdd { inner: dir.clone(), adds: 0 };
        let err = store.create(&mut failing, "Lab").unwrap_err();
        assert_eq!(err.error_code(), "DIRECTORY_ERROR");
        assert_eq!(dir.len(), before);

        // Only the template directory is left.
        let policies = tmp.path().join("example.com/Policies");
        assert_eq!(std::fs::read_dir(policies).unwrap().count(), 1);
    }

    #[test]
    fn test_direct_create_requires_template() {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.sysvol.root = tmp.path().to_path_buf();
        let store = DirectPolicyStore::new(&settings);
        let mut dir = MemoryDirectory::new(DOMAIN);
        assert_eq!(store.create(&mut dir, "Lab").unwrap_err().error_code(), "NOT_FOUND");
    }

    /// Lets the first add through and fails the next one.
    struct FailingSecondAdd {
        inner: MemoryDirectory,
        adds: usize,
    }

    impl DirectoryService for FailingSecondAdd {
        fn domain_dn(&self) -> &str {
            self.inner.domain_dn()
        }
        fn search(
            &mut self,
            base: &str,
            scope: crate::infrastructure::directory::SearchScope,
            filter: &crate::infrastructure::directory::Filter,
            attrs: &[&str],
        ) -> AppResult<Vec<DirEntry>> {
            self.inner.search(base, scope, filter, attrs)
        }
        fn add(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
            self.adds += 1;
            if self.adds == 2 {
                return Err(crate::error::DirectoryError::new("add", dn, "insufficientAccessRights".to_string()).into());
            }
            self.inner.add(dn, attrs)
        }
        fn modify(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
            self.inner.modify(dn, attrs)
        }
        fn delete(&mut self, dn: &str) -> AppResult<()> {
            self.inner.delete(dn)
        }
    }
}

//! Ordered script registry of one policy
//!
//! Each scope keeps its scripts under `<policy>/<Scope>/Scripts/<Kind>/` and
//! records them in `psscripts.ini` next to those directories. Every
//! read-modify-write holds an exclusive lock on a sibling lock file, and a
//! sibling state file remembers the next order id per kind so ids are never
//! handed out twice.

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::directory::{AttrValues, DirectoryService};
use super::permissions::align_tree;
use super::script_log::{validate_value, ScriptLog, SCRIPT_LOG_FILE};
use crate::domain::{PolicyScripts, ScriptEntry, ScriptKind, ScriptRef, ScriptScope};
use crate::error::{AppError, AppResult};

const LOCK_FILE: &str = ".psscripts.lock";
const STATE_FILE: &str = ".psscripts.state.json";

/// Next order id per section
#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderState {
    next: BTreeMap<String, u32>,
}

impl OrderState {
    fn load(path: &Path) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| AppError::file(format!("Corrupt order state {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AppError::file(format!("Cannot read {}", path.display()), e)),
        }
    }

    fn save(&self, path: &Path) -> AppResult<()> {
        let text = serde_json::to_string_pretty(self)
            .map_err(|e| AppError::file("Cannot encode order state", e))?;
        std::fs::write(path, text).map_err(|e| AppError::file(format!("Cannot write {}", path.display()), e))
    }
}

/// Copy `source` into `dest_dir`, adding `_<8 hex>` to the stem if the name is taken.
pub fn copy_with_unique_name(source: &Path, dest_dir: &Path) -> AppResult<PathBuf> {
    let file_name = source
        .file_name()
        .ok_or_else(|| AppError::InvalidInput(format!("{} has no file name", source.display())))?;
    let mut dest = dest_dir.join(file_name);

    while dest.exists() {
        let stem = source.file_stem().map(|s| s.to_string_lossy()).unwrap_or_default();
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        let name = match source.extension() {
            Some(ext) => format!("{}_{}.{}", stem, suffix, ext.to_string_lossy()),
            None => format!("{}_{}", stem, suffix),
        };
        dest = dest_dir.join(name);
    }

    std::fs::copy(source, &dest)
        .map_err(|e| AppError::file(format!("Cannot copy {} to {}", source.display(), dest.display()), e))?;
    Ok(dest)
}

fn discard_copy(copied: &Path) {
    if let Err(e) = std::fs::remove_file(copied) {
        warn!(path = %copied.display(), error = %e, "Could not remove copied script");
    }
}

/// Append `token` unless already listed.
pub fn merge_extension_names(current: &str, token: &str) -> String {
    if current.to_ascii_uppercase().contains(&token.to_ascii_uppercase()) {
        current.to_string()
    } else {
        format!("{}{}", current, token)
    }
}

/// Scripts of one policy, rooted at its directory on the policy volume.
#[derive(Debug, Clone)]
pub struct ScriptRegistry {
    policy_root: PathBuf,
}

impl ScriptRegistry {
    pub fn new(policy_root: impl Into<PathBuf>) -> Self {
        Self {
            policy_root: policy_root.into(),
        }
    }

    /// `<policy>/<Scope>/Scripts`
    pub fn scripts_dir(&self, scope: ScriptScope) -> PathBuf {
        self.policy_root.join(scope.dir_name()).join("Scripts")
    }

    pub fn log_path(&self, scope: ScriptScope) -> PathBuf {
        self.scripts_dir(scope).join(SCRIPT_LOG_FILE)
    }

    /// Exclusive lock on the scope, released when the file is dropped.
    fn lock(&self, scope: ScriptScope) -> AppResult<File> {
        let dir = self.scripts_dir(scope);
        std::fs::create_dir_all(&dir)
            .map_err(|e| AppError::file(format!("Cannot create {}", dir.display()), e))?;
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| AppError::file(format!("Cannot open lock {}", path.display()), e))?;
        file.lock_exclusive()
            .map_err(|e| AppError::file(format!("Cannot lock {}", path.display()), e))?;
        Ok(file)
    }

    pub fn list(&self) -> AppResult<PolicyScripts> {
        let mut scripts = PolicyScripts::default();
        for scope in [ScriptScope::User, ScriptScope::Machine] {
            let dir = self.scripts_dir(scope);
            let log = ScriptLog::load(&dir.join(SCRIPT_LOG_FILE))?;
            for kind in scope.kinds() {
                *scripts.for_kind_mut(*kind) = log.entries(*kind, &dir)?;
            }
        }
        Ok(scripts)
    }

    /// Order id of a script. `None` when no such script is registered.
    pub fn resolve(&self, kind: ScriptKind, script: &ScriptRef) -> AppResult<Option<u32>> {
        let log = ScriptLog::load(&self.log_path(kind.scope()))?;
        Self::resolve_in(&log, kind, script)
    }

    fn resolve_in(log: &ScriptLog, kind: ScriptKind, script: &ScriptRef) -> AppResult<Option<u32>> {
        match script {
            ScriptRef::Order(order) => Ok(log.contains(kind, *order)?.then_some(*order)),
            ScriptRef::Name(name) => {
                let file_name = Path::new(name)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| name.clone());
                log.find_by_name(kind, &file_name)
            }
        }
    }

    /// Register a copy of `source` and update the policy object.
    ///
    /// While the scope lock is held: the script is copied, the next order id
    /// allocated and logged, the extension names merged and the policy
    /// version raised by one. A failed directory update undoes the log entry.
    pub fn add(
        &self,
        dir: &mut dyn DirectoryService,
        policy_dn: &str,
        kind: ScriptKind,
        source: &Path,
        parameters: &str,
    ) -> AppResult<ScriptEntry> {
        validate_value("Parameters", parameters)?;
        let source_name = source.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
        validate_value("Script name", &source_name)?;
        if !source.is_file() {
            return Err(AppError::NotFound(format!("Script {} not found", source.display())));
        }

        let scope = kind.scope();
        let _lock = self.lock(scope)?;
        let scripts_dir = self.scripts_dir(scope);
        let kind_dir = scripts_dir.join(kind.section());
        std::fs::create_dir_all(&kind_dir)
            .map_err(|e| AppError::file(format!("Cannot create {}", kind_dir.display()), e))?;

        let log_path = scripts_dir.join(SCRIPT_LOG_FILE);
        let state_path = scripts_dir.join(STATE_FILE);
        let previous = ScriptLog::load(&log_path)?;
        let mut state = OrderState::load(&state_path)?;

        let after_existing = previous.max_order(kind)?.map(|o| o + 1).unwrap_or(0);
        let stored = state.next.get(kind.section()).copied().unwrap_or(0);
        let order = after_existing.max(stored);

        let copied = copy_with_unique_name(source, &kind_dir)?;
        let script_name = copied
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut log = previous.clone();
        if let Err(e) = log.append(kind, order, &script_name, parameters) {
            discard_copy(&copied);
            return Err(e);
        }
        log.save(&log_path)?;
        state.next.insert(kind.section().to_string(), order + 1);
        state.save(&state_path)?;
        debug!(kind = %kind, order, script = %script_name, "Script logged");

        if let Err(e) = self.update_policy_object(dir, policy_dn, kind) {
            warn!(policy = policy_dn, error = %e, "Directory update failed, reverting script log");
            if let Err(undo) = previous.save(&log_path) {
                warn!(error = %undo, "Could not restore script log");
            }
            discard_copy(&copied);
            return Err(e);
        }

        align_tree(&self.policy_root, &self.policy_root)?;
        info!(policy = policy_dn, kind = %kind, order, script = %script_name, "Script added");

        Ok(ScriptEntry {
            order,
            script: copied,
            parameters: parameters.to_string(),
        })
    }

    /// Merge the extension token for `kind` and raise the version by one.
    fn update_policy_object(&self, dir: &mut dyn DirectoryService, policy_dn: &str, kind: ScriptKind) -> AppResult<()> {
        let attribute = kind.extension_attribute();
        let entry = dir
            .read(policy_dn, &["versionNumber", attribute])?
            .ok_or_else(|| AppError::NotFound(format!("Policy {} not found", policy_dn)))?;

        let raw = entry.first("versionNumber").unwrap_or_default();
        let version = raw
            .trim()
            .parse::<u32>()
            .ok()
            .and_then(|v| v.checked_add(1))
            .ok_or_else(|| {
                AppError::FileOperationFailed(format!(
                    "Policy {} has an unusable versionNumber '{}'",
                    policy_dn, raw
                ))
            })?;
        let names = merge_extension_names(entry.first(attribute).unwrap_or_default(), kind.extension_token());

        let changes: AttrValues = vec![
            (attribute.to_string(), vec![names]),
            ("versionNumber".to_string(), vec![version.to_string()]),
        ];
        dir.modify(policy_dn, &changes)
    }

    /// Remove a script from the log. The copied file is left in place.
    pub fn delete(&self, kind: ScriptKind, script: &ScriptRef) -> AppResult<u32> {
        let scope = kind.scope();
        let _lock = self.lock(scope)?;
        let log_path = self.log_path(scope);
        let mut log = ScriptLog::load(&log_path)?;

        let order = Self::resolve_in(&log, kind, script)?
            .ok_or_else(|| AppError::NotFound(format!("Script {} not found in {}", script, kind)))?;
        if !log.remove(kind, order) {
            return Err(AppError::NotFound(format!("Script {} not found in {}", script, kind)));
        }
        log.save(&log_path)?;
        info!(kind = %kind, order, "Script removed");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PolicyGuid;
    use crate::domain::policy_dn;
    use crate::infrastructure::directory::{DirEntry, MemoryDirectory};

    const DOMAIN: &str = "DC=example,DC=com";

    struct Fixture {
        _tmp: tempfile::TempDir,
        dir: MemoryDirectory,
        dn: String,
        registry: ScriptRegistry,
        source: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("policy");
        std::fs::create_dir_all(&root).unwrap();
        let source = tmp.path().join("map-drives.ps1");
        std::fs::write(&source, "net use Z: \\\\fs\\share").unwrap();

        let dir = MemoryDirectory::new(DOMAIN);
        let dn = policy_dn(&PolicyGuid::generate(), DOMAIN);
        dir.insert(DirEntry::new(&dn).with("versionNumber", &["4"]));

        Fixture {
            _tmp: tmp,
            dir,
            dn,
            registry: ScriptRegistry::new(root),
            source,
        }
    }

    fn version(f: &Fixture) -> String {
        f.dir.entry(&f.dn).unwrap().first("versionNumber").unwrap().to_string()
    }

    #[test]
    fn test_add_bumps_version_and_merges_extensions() {
        let f = fixture();
        let mut session = f.dir.clone();
        let entry = f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "-Drive Z").unwrap();
        assert_eq!(entry.order, 0);
        assert!(entry.script.ends_with("User/Scripts/Logon/map-drives.ps1"));
        assert_eq!(version(&f), "5");

        f.registry.add(&mut session, &f.dn, ScriptKind::Logoff, &f.source, "").unwrap();
        assert_eq!(version(&f), "6");
        let names = f.dir.entry(&f.dn).unwrap().first("gPCUserExtensionNames").unwrap().to_string();
        assert_eq!(names, ScriptKind::Logon.extension_token());
    }

    #[test]
    fn test_order_ids_are_never_reused() {
        let f = fixture();
        let mut session = f.dir.clone();
        let a = f.registry.add(&mut session, &f.dn, ScriptKind::Startup, &f.source, "").unwrap();
        assert_eq!(a.order, 0);
        f.registry.delete(ScriptKind::Startup, &ScriptRef::Order(0)).unwrap();
        let b = f.registry.add(&mut session, &f.dn, ScriptKind::Startup, &f.source, "").unwrap();
        assert_eq!(b.order, 1);
        // The copy of A is still there, so B got a disambiguated name.
        assert_ne!(a.script, b.script);
    }

    #[test]
    fn test_delete_does_not_touch_version() {
        let f = fixture();
        let mut session = f.dir.clone();
        f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "").unwrap();
        let before = version(&f);
        f.registry
            .delete(ScriptKind::Logon, &ScriptRef::Name("map-drives.ps1".to_string()))
            .unwrap();
        assert_eq!(version(&f), before);
        assert!(f.registry.list().unwrap().login.is_empty());
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let f = fixture();
        let err = f.registry.delete(ScriptKind::Shutdown, &ScriptRef::Order(7)).unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
        assert_eq!(
            f.registry
                .resolve(ScriptKind::Shutdown, &ScriptRef::Name("x.ps1".to_string()))
                .unwrap(),
            None
        );
    }

    #[test]
    fn test_list_groups_by_kind() {
        let f = fixture();
        let mut session = f.dir.clone();
        f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "").unwrap();
        f.registry.add(&mut session, &f.dn, ScriptKind::Shutdown, &f.source, "-Now").unwrap();
        let scripts = f.registry.list().unwrap();
        assert_eq!(scripts.login.len(), 1);
        assert_eq!(scripts.shutdown.len(), 1);
        assert_eq!(scripts.shutdown[0].parameters, "-Now");
        assert!(scripts.logoff.is_empty() && scripts.startup.is_empty());
    }

    #[test]
    fn test_failed_directory_update_reverts_log() {
        let f = fixture();
        f.dir.fail_writes_to(&f.dn);
        let mut session = f.dir.clone();
        let err = f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "").unwrap_err();
        assert_eq!(err.error_code(), "DIRECTORY_ERROR");
        assert!(f.registry.list().unwrap().login.is_empty());
        assert_eq!(version(&f), "4");
    }

    #[test]
    fn test_line_breaks_in_parameters_are_rejected() {
        let f = fixture();
        let mut session = f.dir.clone();
        let err = f
            .registry
            .add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "-a\n7CmdLine=evil.ps1\n7Parameters=")
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(f.registry.list().unwrap().login.is_empty());
        assert!(!f.registry.scripts_dir(ScriptScope::User).join("Logon").exists());
        assert_eq!(version(&f), "4");
    }

    #[test]
    fn test_unusable_version_is_an_error() {
        let f = fixture();
        let mut session = f.dir.clone();
        session
            .modify(&f.dn, &vec![("versionNumber".to_string(), vec!["garbage".to_string()])])
            .unwrap();
        let err = f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "").unwrap_err();
        assert_eq!(err.error_code(), "FILE_OPERATION_FAILED");
        assert!(f.registry.list().unwrap().login.is_empty());

        session
            .modify(&f.dn, &vec![("versionNumber".to_string(), vec![u32::MAX.to_string()])])
            .unwrap();
        assert!(f.registry.add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "").is_err());
        assert_eq!(version(&f), u32::MAX.to_string());
    }

    #[test]
    fn test_missing_source() {
        let f = fixture();
        let mut session = f.dir.clone();
        let err = f
            .registry
            .add(&mut session, &f.dn, ScriptKind::Logon, Path::new("/no/such.ps1"), "")
            .unwrap_err();
        assert_eq!(err.error_code(), "NOT_FOUND");
    }

    #[test]
    fn test_concurrent_adds_get_distinct_orders() {
        let f = fixture();
        let orders: Vec<u32> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    scope.spawn(|| {
                        let mut session = f.dir.clone();
                        f.registry
                            .add(&mut session, &f.dn, ScriptKind::Logon, &f.source, "")
                            .unwrap()
                            .order
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let mut sorted = orders.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
        assert_eq!(version(&f), "8");
    }

    #[test]
    fn test_merge_extension_names() {
        let token = "[{42B5FA88-6536-11D2-AE5A-0000F87571E3}]";
        assert_eq!(merge_extension_names("", token), token);
        assert_eq!(merge_extension_names(&token.to_lowercase(), token), token.to_lowercase());
    }
}

//! Per-controller presence checks for a policy
//!
//! Replication between domain controllers is not instant. A policy that
//! exists on some controllers but not on others is still replicating and
//! must not be modified until every controller agrees.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::connection::DirectoryConnector;
use super::directory::{Filter, SearchScope};
use crate::domain::{policy_dn, PolicyGuid};
use crate::error::{AppError, AppResult};

/// `userAccountControl` bit of domain controller accounts
pub const SERVER_TRUST_ACCOUNT: u32 = 8192;

const PROBE_ATTRS: &[&str] = &["displayName", "gPCFileSysPath", "versionNumber"];

/// Probes every domain controller for a policy.
#[derive(Clone)]
pub struct AvailabilityChecker {
    connector: Arc<dyn DirectoryConnector>,
    max_workers: usize,
}

impl AvailabilityChecker {
    pub fn new(connector: Arc<dyn DirectoryConnector>, max_workers: usize) -> Self {
        Self {
            connector,
            max_workers: max_workers.max(1),
        }
    }

    /// DNS host names of all domain controllers, sorted.
    pub fn list_controllers(&self) -> AppResult<Vec<String>> {
        let mut dir = self.connector.connect(None)?;
        let domain_dn = dir.domain_dn().to_string();
        let filter = Filter::And(vec![
            Filter::eq("objectClass", "computer"),
            Filter::BitAnd("userAccountControl".to_string(), SERVER_TRUST_ACCOUNT),
        ]);

        let mut hosts: Vec<String> = dir
            .search(&domain_dn, SearchScope::Subtree, &filter, &["dNSHostName"])?
            .iter()
            .filter_map(|e| e.first("dNSHostName"))
            .map(str::to_string)
            .collect();
        hosts.sort();
        hosts.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        debug!(count = hosts.len(), "Domain controllers discovered");
        Ok(hosts)
    }

    /// Whether one controller can currently read the policy. Failures count as absent.
    fn probe(&self, host: &str, guid: &PolicyGuid) -> bool {
        let result = self.connector.connect(Some(host)).and_then(|mut dir| {
            let dn = policy_dn(guid, dir.domain_dn());
            dir.read(&dn, PROBE_ATTRS)
        });
        match result {
            Ok(found) => found.is_some(),
            Err(e) => {
                warn!(controller = host, policy = %guid, error = %e, "Availability probe failed");
                false
            }
        }
    }

    /// Presence of the policy on each controller.
    ///
    /// Controllers are probed concurrently, at most `max_workers` at a time.
    pub fn availability(&self, guid: &PolicyGuid) -> AppResult<BTreeMap<String, bool>> {
        let hosts = self.list_controllers()?;
        let results = Mutex::new(BTreeMap::new());
        let next = AtomicUsize::new(0);
        let workers = self.max_workers.min(hosts.len());

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(host) = hosts.get(index) else {
                        break;
                    };
                    let present = self.probe(host, guid);
                    results
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(host.clone(), present);
                });
            }
        });

        let results = results.into_inner().unwrap_or_else(|e| e.into_inner());
        info!(policy = %guid, controllers = results.len(), "Availability checked");
        Ok(results)
    }

    /// True when every controller agrees, whether present or absent.
    pub fn integrity(&self, guid: &PolicyGuid) -> AppResult<bool> {
        Ok(is_homogeneous(&self.availability(guid)?))
    }

    /// `Conflict` unless the policy is consistent across controllers.
    pub fn ensure_consistent(&self, guid: &PolicyGuid) -> AppResult<()> {
        if self.integrity(guid)? {
            Ok(())
        } else {
            Err(AppError::Conflict(format!(
                "Policy {} is not available on all controllers",
                guid
            )))
        }
    }
}

pub fn is_homogeneous(map: &BTreeMap<String, bool>) -> bool {
    let mut values = map.values();
    match values.next() {
        Some(first) => values.all(|v| v == first),
        None => true,
    }
}

use tracing::{debug, error, warn};

use super::{AttrValues, DirEntry, DirectoryService};
use crate::error::AppResult;

/// Attributes the server maintains itself; never written back on restore.
const OPERATIONAL_ATTRS: &[&str] = &[
    "distinguishedName",
    "whenCreated",
    "whenChanged",
    "uSNCreated",
    "uSNChanged",
    "objectGUID",
    "objectSid",
    "instanceType",
];

enum Undo {
    /// Remove an entry that was added
    Remove(String),
    /// Re-add an entry that was deleted
    Restore(DirEntry),
    /// Put back attribute values that were replaced
    Revert(String, AttrValues),
}

/// Groups several writes so they can be undone together.
///
/// Every write records its compensating write. `rollback`, or dropping the
/// transaction without `commit`, replays them newest first.
pub struct Transaction<'a> {
    dir: &'a mut dyn DirectoryService,
    journal: Vec<Undo>,
    finished: bool,
}

impl<'a> Transaction<'a> {
    pub fn begin(dir: &'a mut dyn DirectoryService) -> Self {
        debug!("Directory transaction started");
        Self {
            dir,
            journal: Vec::new(),
            finished: false,
        }
    }

    /// Read access to the underlying session
    pub fn directory(&mut self) -> &mut dyn DirectoryService {
        &mut *self.dir
    }

    pub fn add(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        self.dir.add(dn, attrs)?;
        self.journal.push(Undo::Remove(dn.to_string()));
        Ok(())
    }

    pub fn modify(&mut self, dn: &str, attrs: &AttrValues) -> AppResult<()> {
        let names: Vec<&str> = attrs.iter().map(|(name, _)| name.as_str()).collect();
        let before = self.dir.read(dn, &names)?.unwrap_or_default();
        let prior: AttrValues = attrs
            .iter()
            .map(|(name, _)| {
                let values = before.values(name).map(<[String]>::to_vec).unwrap_or_default();
                (name.clone(), values)
            })
            .collect();

        self.dir.modify(dn, attrs)?;
        self.journal.push(Undo::Revert(dn.to_string(), prior));
        Ok(())
    }

    pub fn delete(&mut self, dn: &str) -> AppResult<()> {
        let snapshot = self.dir.read(dn, &["*"])?;
        self.dir.delete(dn)?;
        if let Some(snapshot) = snapshot {
            self.journal.push(Undo::Restore(snapshot));
        }
        Ok(())
    }

    pub fn commit(mut self) {
        debug!(writes = self.journal.len(), "Directory transaction committed");
        self.journal.clear();
        self.finished = true;
    }

    /// Undo every write. Keeps going past failures and returns the first one.
    pub fn rollback(mut self) -> AppResult<()> {
        self.finished = true;
        self.unwind()
    }

    fn unwind(&mut self) -> AppResult<()> {
        let mut first_error = None;
        while let Some(step) = self.journal.pop() {
            let result = match &step {
                Undo::Remove(dn) => self.dir.delete(dn),
                Undo::Restore(entry) => {
                    let attrs: AttrValues = entry
                        .attrs
                        .iter()
                        .filter(|(name, _)| !OPERATIONAL_ATTRS.iter().any(|op| op.eq_ignore_ascii_case(name)))
                        .map(|(name, values)| (name.clone(), values.clone()))
                        .collect();
                    self.dir.add(&entry.dn, &attrs)
                }
                Undo::Revert(dn, prior) => self.dir.modify(dn, prior),
            };
            if let Err(e) = result {
                error!(error = %e, "Rollback step failed");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished && !self.journal.is_empty() {
            warn!(writes = self.journal.len(), "Transaction dropped without commit, rolling back");
            let _ = self.unwind();
        }
    }
}

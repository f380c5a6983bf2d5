//! `psscripts.ini` reader and writer
//!
//! One file per scope, one section per script kind, each script stored as a
//! `<order>CmdLine` / `<order>Parameters` key pair. Clients read this file
//! themselves so the key naming is kept exactly.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::domain::{ScriptEntry, ScriptKind};
use crate::error::{AppError, AppResult};

pub const SCRIPT_LOG_FILE: &str = "psscripts.ini";

const CMD_LINE: &str = "CmdLine";
const PARAMETERS: &str = "Parameters";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Section {
    name: String,
    entries: Vec<(String, String)>,
}

/// Parsed script log, keeping section and key order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptLog {
    sections: Vec<Section>,
}

/// Values are stored one per line, so line breaks would forge extra keys.
pub fn validate_value(field: &str, value: &str) -> AppResult<()> {
    if value.contains(['\r', '\n']) {
        return Err(AppError::InvalidInput(format!("{} cannot contain line breaks", field)));
    }
    Ok(())
}

/// Order number of a `<n>CmdLine` / `<n>Parameters` key.
fn key_order(key: &str, suffix: &str) -> Option<Result<u32, String>> {
    let split = key.len().checked_sub(suffix.len())?;
    let (prefix, tail) = (key.get(..split)?, key.get(split..)?);
    if !tail.eq_ignore_ascii_case(suffix) {
        return None;
    }
    Some(prefix.parse::<u32>().map_err(|_| key.to_string()))
}

fn integrity_error(kind: ScriptKind, detail: &str) -> AppError {
    AppError::FileOperationFailed(format!(
        "{} integrity error in section {}: {}",
        SCRIPT_LOG_FILE, kind, detail
    ))
}

impl ScriptLog {
    pub fn parse(text: &str) -> AppResult<Self> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut log = ScriptLog::default();

        for (number, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                log.section_mut(name.trim());
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(AppError::FileOperationFailed(format!(
                    "{} line {}: expected key=value",
                    SCRIPT_LOG_FILE,
                    number + 1
                )));
            };
            let Some(section) = log.sections.last_mut() else {
                return Err(AppError::FileOperationFailed(format!(
                    "{} line {}: entry outside of a section",
                    SCRIPT_LOG_FILE,
                    number + 1
                )));
            };
            section.entries.push((key.trim().to_string(), value.trim().to_string()));
        }
        Ok(log)
    }

    /// A missing file is an empty log.
    pub fn load(path: &Path) -> AppResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(AppError::file(format!("Cannot read {}", path.display()), e)),
        }
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn section_mut(&mut self, name: &str) -> &mut Section {
        let index = match self.sections.iter().position(|s| s.name.eq_ignore_ascii_case(name)) {
            Some(index) => index,
            None => {
                self.sections.push(Section {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                self.sections.len() - 1
            }
        };
        &mut self.sections[index]
    }

    /// Verified (order, script name, parameters) triples of a section, in file order.
    fn pairs(&self, kind: ScriptKind) -> AppResult<Vec<(u32, String, String)>> {
        let Some(section) = self.section(kind.section()) else {
            return Ok(Vec::new());
        };

        let mut commands = Vec::new();
        let mut parameters = Vec::new();
        for (key, value) in &section.entries {
            if let Some(order) = key_order(key, CMD_LINE) {
                let order = order.map_err(|k| integrity_error(kind, &format!("bad key '{}'", k)))?;
                commands.push((order, value.clone()));
            } else if let Some(order) = key_order(key, PARAMETERS) {
                let order = order.map_err(|k| integrity_error(kind, &format!("bad key '{}'", k)))?;
                parameters.push((order, value.clone()));
            }
        }

        if commands.len() != parameters.len() {
            return Err(integrity_error(
                kind,
                &format!("{} command lines but {} parameter lines", commands.len(), parameters.len()),
            ));
        }
        commands
            .into_iter()
            .zip(parameters)
            .map(|((order, script), (param_order, params))| {
                if order == param_order {
                    Ok((order, script, params))
                } else {
                    Err(integrity_error(
                        kind,
                        &format!("command {} paired with parameters {}", order, param_order),
                    ))
                }
            })
            .collect()
    }

    /// Entries of one kind. Script paths resolve under `scripts_dir/<Kind>/`.
    pub fn entries(&self, kind: ScriptKind, scripts_dir: &Path) -> AppResult<Vec<ScriptEntry>> {
        Ok(self
            .pairs(kind)?
            .into_iter()
            .map(|(order, script, parameters)| ScriptEntry {
                order,
                script: scripts_dir.join(kind.section()).join(script),
                parameters,
            })
            .collect())
    }

    pub fn max_order(&self, kind: ScriptKind) -> AppResult<Option<u32>> {
        Ok(self.pairs(kind)?.into_iter().map(|(order, _, _)| order).max())
    }

    /// Order of the script registered under `name`, if any.
    pub fn find_by_name(&self, kind: ScriptKind, name: &str) -> AppResult<Option<u32>> {
        Ok(self
            .pairs(kind)?
            .into_iter()
            .find(|(_, script, _)| script == name)
            .map(|(order, _, _)| order))
    }

    pub fn contains(&self, kind: ScriptKind, order: u32) -> AppResult<bool> {
        Ok(self.pairs(kind)?.iter().any(|(o, _, _)| *o == order))
    }

    pub fn append(
        &mut self,
        kind: ScriptKind,
        order: u32,
        script_name: &str,
        parameters: &str,
    ) -> AppResult<()> {
        validate_value("Script name", script_name)?;
        validate_value("Parameters", parameters)?;
        let section = self.section_mut(kind.section());
        section
            .entries
            .push((format!("{}{}", order, CMD_LINE), script_name.to_string()));
        section
            .entries
            .push((format!("{}{}", order, PARAMETERS), parameters.to_string()));
        Ok(())
    }

    /// Drop both keys of `order`. Returns false when neither existed.
    pub fn remove(&mut self, kind: ScriptKind, order: u32) -> bool {
        let section = self.section_mut(kind.section());
        let before = section.entries.len();
        section.entries.retain(|(key, _)| {
            let matches = |suffix| matches!(key_order(key, suffix), Some(Ok(o)) if o == order);
            !(matches(CMD_LINE) || matches(PARAMETERS))
        });
        section.entries.len() != before
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            out.push_str(&format!("[{}]\r\n", section.name));
            for (key, value) in &section.entries {
                out.push_str(&format!("{}={}\r\n", key, value));
            }
            out.push_str("\r\n");
        }
        out
    }

    /// Replace the file atomically.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        let dir: PathBuf = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| AppError::file(format!("Cannot create temp file in {}", dir.display()), e))?;
        tmp.write_all(self.render().as_bytes())
            .map_err(|e| AppError::file("Cannot write script log", e))?;
        tmp.persist(path)
            .map_err(|e| AppError::file(format!("Cannot replace {}", path.display()), e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\u{feff}[Logon]\r\n0CmdLine=map.ps1\r\n0Parameters=-Drive Z\r\n\r\n; comment\n[Logoff]\n12CmdLine=bye.ps1\n12Parameters=\n";

    #[test]
    fn test_parse_and_entries() {
        let log = ScriptLog::parse(SAMPLE).unwrap();
        let scripts = Path::new("/p/User/Scripts");
        let logon = log.entries(ScriptKind::Logon, scripts).unwrap();
        assert_eq!(logon.len(), 1);
        assert_eq!(logon[0].order, 0);
        assert_eq!(logon[0].script, PathBuf::from("/p/User/Scripts/Logon/map.ps1"));
        assert_eq!(logon[0].parameters, "-Drive Z");

        assert_eq!(log.max_order(ScriptKind::Logoff).unwrap(), Some(12));
        assert!(log.entries(ScriptKind::Startup, scripts).unwrap().is_empty());
    }

    #[test]
    fn test_multi_digit_orders() {
        let log = ScriptLog::parse("[Startup]\n10CmdLine=a.ps1\n10Parameters=\n9CmdLine=b.ps1\n9Parameters=\n").unwrap();
        assert_eq!(log.max_order(ScriptKind::Startup).unwrap(), Some(10));
        assert_eq!(log.find_by_name(ScriptKind::Startup, "b.ps1").unwrap(), Some(9));
        assert_eq!(log.find_by_name(ScriptKind::Startup, "c.ps1").unwrap(), None);
    }

    #[test]
    fn test_integrity_violations() {
        let unbalanced = ScriptLog::parse("[Logon]\n0CmdLine=a.ps1\n").unwrap();
        let err = unbalanced.entries(ScriptKind::Logon, Path::new("/")).unwrap_err();
        assert_eq!(err.error_code(), "FILE_OPERATION_FAILED");

        let mismatched =
            ScriptLog::parse("[Logon]\n0CmdLine=a.ps1\n1Parameters=\n").unwrap();
        assert!(mismatched.max_order(ScriptKind::Logon).is_err());

        let bad_key = ScriptLog::parse("[Logon]\nxCmdLine=a.ps1\nxParameters=\n").unwrap();
        assert!(bad_key.max_order(ScriptKind::Logon).is_err());
    }

    #[test]
    fn test_append_remove_render() {
        let mut log = ScriptLog::default();
        log.append(ScriptKind::Shutdown, 3, "halt.ps1", "-Force").unwrap();
        assert_eq!(log.render(), "[Shutdown]\r\n3CmdLine=halt.ps1\r\n3Parameters=-Force\r\n\r\n");

        assert!(log.remove(ScriptKind::Shutdown, 3));
        assert!(!log.remove(ScriptKind::Shutdown, 3));
        assert!(!log.contains(ScriptKind::Shutdown, 3).unwrap());
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(SCRIPT_LOG_FILE);
        assert_eq!(ScriptLog::load(&path).unwrap(), ScriptLog::default());

        let mut log = ScriptLog::default();
        log.append(ScriptKind::Logon, 0, "a.ps1", "").unwrap();
        log.save(&path).unwrap();
        assert_eq!(ScriptLog::load(&path).unwrap(), log);
    }

    #[test]
    fn test_append_rejects_line_breaks() {
        let mut log = ScriptLog::default();
        let err = log
            .append(ScriptKind::Logon, 0, "a.ps1", "-a\n7CmdLine=evil.ps1\n7Parameters=")
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
        assert!(log.append(ScriptKind::Logon, 0, "a\r.ps1", "").is_err());
        assert_eq!(log, ScriptLog::default());
    }

    #[test]
    fn test_line_outside_section() {
        assert!(ScriptLog::parse("0CmdLine=a.ps1\n").is_err());
    }
}

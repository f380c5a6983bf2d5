use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::guid::PolicyGuid;
use crate::error::{AppError, AppResult};

/// Attributes read for every policy object
pub const POLICY_ATTRS: &[&str] = &[
    "displayName",
    "name",
    "distinguishedName",
    "gPCFileSysPath",
    "whenCreated",
    "whenChanged",
    "versionNumber",
    "gPCUserExtensionNames",
    "gPCMachineExtensionNames",
    "gPCFunctionalityVersion",
];

/// Container attribute holding the link tokens
pub const GP_LINK_ATTR: &str = "gPLink";

/// Object class of policy containers
pub const POLICY_OBJECT_CLASS: &str = "groupPolicyContainer";

static SAFE_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w\-.]+$").expect("static name pattern"));

/// A Group Policy Object as stored in the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyObject {
    pub guid: PolicyGuid,
    pub name: String,
    pub dn: String,
    /// UNC path from `gPCFileSysPath`
    pub path: String,
    /// Path on the local policy volume
    pub local_path: PathBuf,
    pub version: u32,
    pub user_extension_names: String,
    pub machine_extension_names: String,
    pub functionality_version: u32,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub linked_to: Vec<String>,
}

/// `CN=Policies,CN=System,<domain>`
pub fn policies_container_dn(domain_dn: &str) -> String {
    format!("CN=Policies,CN=System,{}", domain_dn)
}

pub fn policy_dn(guid: &PolicyGuid, domain_dn: &str) -> String {
    format!("CN={},{}", guid, policies_container_dn(domain_dn))
}

/// `<sysvol>/<realm>/Policies/<GUID>`
pub fn local_policy_path(sysvol_root: &Path, realm: &str, guid: &PolicyGuid) -> PathBuf {
    sysvol_root.join(realm).join("Policies").join(guid.as_str())
}

/// `\\<realm>\sysvol\<realm>\Policies\<GUID>`
pub fn unc_policy_path(realm: &str, guid: &PolicyGuid) -> String {
    format!("\\\\{0}\\sysvol\\{0}\\Policies\\{1}", realm, guid)
}

/// Convert domain DN to DNS name
pub fn realm_from_dn(dn: &str) -> String {
    dn.split(',')
        .map(str::trim)
        .filter(|s| s.len() > 3 && s.get(..3).map_or(false, |p| p.eq_ignore_ascii_case("DC=")))
        .map(|s| &s[3..])
        .collect::<Vec<_>>()
        .join(".")
}

/// Reject anything but word characters, dashes and dots.
pub fn validate_safe(value: &str, field: &str) -> AppResult<()> {
    if SAFE_NAME.is_match(value) {
        Ok(())
    } else {
        Err(AppError::InvalidInput(format!(
            "Unsafe characters detected in {}: '{}'",
            field, value
        )))
    }
}

/// Parse directory generalized time such as `20240315102233.0Z`.
pub fn parse_generalized_time(value: &str) -> Option<DateTime<Utc>> {
    let trimmed = value.trim_end_matches('Z');
    let (base, fraction) = match trimmed.split_once('.') {
        Some((base, fraction)) => (base, fraction),
        None => (trimmed, ""),
    };
    let mut parsed = NaiveDateTime::parse_from_str(base, "%Y%m%d%H%M%S").ok()?;
    if !fraction.is_empty() && fraction.chars().all(|c| c.is_ascii_digit()) {
        let digits = &fraction[..fraction.len().min(9)];
        let nanos = digits.parse::<u32>().ok()? * 10u32.pow(9 - digits.len() as u32);
        parsed = parsed.with_nanosecond(nanos)?;
    }
    Some(DateTime::from_naive_utc_and_offset(parsed, Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn test_policy_dn() {
        let guid = PolicyGuid::parse("31b2f340-016d-11d2-945f-00c04fb984f9").unwrap();
        assert_eq!(
            policy_dn(&guid, "DC=example,DC=com"),
            "CN={31B2F340-016D-11D2-945F-00C04FB984F9},CN=Policies,CN=System,DC=example,DC=com"
        );
    }

    #[test]
    fn test_realm_from_dn() {
        assert_eq!(realm_from_dn("DC=example,DC=com"), "example.com");
        assert_eq!(realm_from_dn("OU=x, dc=lab,DC=example,DC=org"), "lab.example.org");
    }

    #[test]
    fn test_validate_safe() {
        assert!(validate_safe("Lab-Policy_1.0", "Name").is_ok());
        assert!(validate_safe("bad name", "Name").is_err());
        assert!(validate_safe("x;rm -rf", "Name").is_err());
        assert!(validate_safe("", "Name").is_err());
    }

    #[test]
    fn test_parse_generalized_time() {
        let t = parse_generalized_time("20240315102233.0Z").unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2024, 3, 15));
        assert_eq!((t.hour(), t.minute(), t.second()), (10, 22, 33));

        let t = parse_generalized_time("20240315102233.5Z").unwrap();
        assert_eq!(t.nanosecond(), 500_000_000);

        assert!(parse_generalized_time("yesterday").is_none());
    }
}

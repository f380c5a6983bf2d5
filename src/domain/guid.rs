use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{AppError, AppResult};

static GUID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\{?[0-9A-Fa-f]{8}-(?:[0-9A-Fa-f]{4}-){3}[0-9A-Fa-f]{12}\}?$")
        .expect("static GUID pattern")
});

/// Matches the first braced GUID in free text, e.g. tool output.
static GUID_IN_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{([0-9A-Fa-f]{8}-(?:[0-9A-Fa-f]{4}-){3}[0-9A-Fa-f]{12})\}")
        .expect("static GUID pattern")
});

/// Identifier of a policy object in canonical `{XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX}` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PolicyGuid(String);

impl PolicyGuid {
    /// Validate and normalize. Braces are optional, hex digits are upper-cased.
    pub fn parse(value: &str) -> AppResult<Self> {
        let value = value.trim();
        // Unbalanced braces are rejected even though the pattern tolerates them.
        let balanced = value.starts_with('{') == value.ends_with('}');
        if !balanced || !GUID_PATTERN.is_match(value) {
            return Err(AppError::InvalidInput(format!("Invalid GUID format: '{}'", value)));
        }

        let bare = value.trim_start_matches('{').trim_end_matches('}');
        Ok(Self(format!("{{{}}}", bare.to_uppercase())))
    }

    /// Find the first braced GUID inside `text`.
    pub fn find_in(text: &str) -> Option<Self> {
        GUID_IN_TEXT
            .captures(text)
            .and_then(|c| c.get(1))
            .map(|m| Self(format!("{{{}}}", m.as_str().to_uppercase())))
    }

    /// A fresh random identifier.
    pub fn generate() -> Self {
        Self(format!("{{{}}}", uuid::Uuid::new_v4().to_string().to_uppercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for PolicyGuid {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        PolicyGuid::parse(&value)
    }
}

impl From<PolicyGuid> for String {
    fn from(value: PolicyGuid) -> Self {
        value.0
    }
}

impl std::str::FromStr for PolicyGuid {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PolicyGuid::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_braced_and_bare() {
        let braced = PolicyGuid::parse("{31B2F340-016D-11D2-945F-00C04FB984F9}").unwrap();
        let bare = PolicyGuid::parse("31b2f340-016d-11d2-945f-00c04fb984f9").unwrap();
        assert_eq!(braced, bare);
        assert_eq!(bare.as_str(), "{31B2F340-016D-11D2-945F-00C04FB984F9}");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "not-a-guid",
            "31B2F340-016D-11D2-945F-00C04FB984F",
            "31B2F340016D11D2945F00C04FB984F9",
            "{31B2F340-016D-11D2-945F-00C04FB984F9",
            "{31B2F340-016D-11D2-945F-00C04FB984FG}",
        ] {
            assert!(
                matches!(PolicyGuid::parse(bad), Err(AppError::InvalidInput(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_find_in_tool_output() {
        let out = "GPO 'Lab' created as {6ac1786c-016f-11d2-945f-00c04fb984f9}\n";
        let guid = PolicyGuid::find_in(out).unwrap();
        assert_eq!(guid.as_str(), "{6AC1786C-016F-11D2-945F-00C04FB984F9}");
        assert!(PolicyGuid::find_in("nothing here").is_none());
    }

    #[test]
    fn test_generated_is_valid() {
        let guid = PolicyGuid::generate();
        assert_eq!(PolicyGuid::parse(guid.as_str()).unwrap(), guid);
    }
}

use std::fmt;

use super::DirEntry;

/// Matching rule OID for bitwise AND on integer attributes
pub const MATCHING_RULE_BIT_AND: &str = "1.2.840.113556.1.4.803";

/// The search filters this crate issues, rendered to RFC 4515 text for LDAP
/// and evaluated directly by the in-memory backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    /// `(objectClass=*)`
    Any,
    Equals(String, String),
    Present(String),
    /// `(attr=*value*)`
    Contains(String, String),
    /// `(attr:1.2.840.113556.1.4.803:=mask)`
    BitAnd(String, u32),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(attr: &str, value: impl Into<String>) -> Self {
        Filter::Equals(attr.to_string(), value.into())
    }

    pub fn present(attr: &str) -> Self {
        Filter::Present(attr.to_string())
    }

    pub fn contains(attr: &str, value: impl Into<String>) -> Self {
        Filter::Contains(attr.to_string(), value.into())
    }

    pub fn matches(&self, entry: &DirEntry) -> bool {
        match self {
            Filter::Any => true,
            Filter::Equals(attr, value) => entry
                .values(attr)
                .map(|vals| vals.iter().any(|v| v.eq_ignore_ascii_case(value)))
                .unwrap_or(false),
            Filter::Present(attr) => entry.values(attr).map(|v| !v.is_empty()).unwrap_or(false),
            Filter::Contains(attr, value) => {
                let needle = value.to_lowercase();
                entry
                    .values(attr)
                    .map(|vals| vals.iter().any(|v| v.to_lowercase().contains(&needle)))
                    .unwrap_or(false)
            }
            Filter::BitAnd(attr, mask) => entry
                .values(attr)
                .map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.trim().parse::<i64>().ok())
                        .any(|v| (v as u32) & mask == *mask)
                })
                .unwrap_or(false),
            Filter::And(filters) => filters.iter().all(|f| f.matches(entry)),
        }
    }
}

/// Escape a value for use inside a filter (RFC 4515 section 3).
pub fn escape_filter_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\5c"),
            '*' => out.push_str("\\2a"),
            '(' => out.push_str("\\28"),
            ')' => out.push_str("\\29"),
            '\0' => out.push_str("\\00"),
            _ => out.push(c),
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::Any => f.write_str("(objectClass=*)"),
            Filter::Equals(attr, value) => write!(f, "({}={})", attr, escape_filter_value(value)),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Contains(attr, value) => write!(f, "({}=*{}*)", attr, escape_filter_value(value)),
            Filter::BitAnd(attr, mask) => write!(f, "({}:{}:={})", attr, MATCHING_RULE_BIT_AND, mask),
            Filter::And(filters) => {
                f.write_str("(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                f.write_str(")")
            }
        }
    }
}

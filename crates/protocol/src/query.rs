//! Kite queries: prefixes of the seven-field canonical path.
//!
//! An empty field widens the query; a non-empty field after an empty
//! one is a gap and rejected. The version field may hold a range
//! expression (`">=0.2.0, <1.0.0"`) instead of an exact version, in
//! which case kontrol resolves the query up to `name` and filters.

use semver::{Version, VersionReq};
use serde::{Deserialize, Serialize};

use crate::kite::Kite;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("username is required")]
    MissingUsername,
    #[error("fields after an empty field must be empty (gap at {0})")]
    Gap(&'static str),
}

/// A query over registered kites.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KiteQuery {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub environment: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub id: String,
}

const FIELD_NAMES: [&str; 7] = [
    "username",
    "environment",
    "name",
    "version",
    "region",
    "hostname",
    "id",
];

impl KiteQuery {
    /// The seven fields in canonical order.
    pub fn fields(&self) -> [&str; 7] {
        [
            &self.username,
            &self.environment,
            &self.name,
            &self.version,
            &self.region,
            &self.hostname,
            &self.id,
        ]
    }

    /// `username` must be present and no non-empty field may follow an
    /// empty one.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.username.is_empty() {
            return Err(QueryError::MissingUsername);
        }
        let mut widened = false;
        for (field, name) in self.fields().iter().zip(FIELD_NAMES) {
            if field.is_empty() {
                widened = true;
            } else if widened {
                return Err(QueryError::Gap(name));
            }
        }
        Ok(())
    }

    /// The canonical path, stopping at the first empty field. The empty
    /// query renders as `/`.
    pub fn canonical_path(&self) -> String {
        let mut out = String::new();
        for field in self.fields() {
            if field.is_empty() {
                break;
            }
            out.push('/');
            out.push_str(field);
        }
        if out.is_empty() {
            out.push('/');
        }
        out
    }

    /// Whether this query's non-empty prefix matches the kite.
    pub fn matches(&self, kite: &Kite) -> bool {
        for (want, have) in self.fields().iter().zip(kite.fields().iter()) {
            if want.is_empty() {
                break;
            }
            if want != have {
                return false;
            }
        }
        true
    }

    /// `Some(req)` when the version field is a range expression rather
    /// than an exact version.
    pub fn version_constraint(&self) -> Option<VersionReq> {
        if self.version.is_empty() || Version::parse(&self.version).is_ok() {
            return None;
        }
        VersionReq::parse(&self.version).ok()
    }

    /// The query with the version field (and everything after it)
    /// cleared — what kontrol actually sends to storage when a version
    /// constraint is attached.
    pub fn up_to_name(&self) -> KiteQuery {
        KiteQuery {
            username: self.username.clone(),
            environment: self.environment.clone(),
            name: self.name.clone(),
            ..Default::default()
        }
    }
}

impl std::fmt::Display for KiteQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.canonical_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full() -> KiteQuery {
        KiteQuery {
            username: "u".into(),
            environment: "e".into(),
            name: "n".into(),
            version: "0.1.0".into(),
            region: "r".into(),
            hostname: "h".into(),
            id: "i".into(),
        }
    }

    #[test]
    fn canonical_path_stops_at_first_empty() {
        let mut q = full();
        q.version.clear();
        q.region.clear();
        q.hostname.clear();
        q.id.clear();
        assert_eq!(q.canonical_path(), "/u/e/n");
        assert_eq!(KiteQuery::default().canonical_path(), "/");
    }

    #[test]
    fn validate_rejects_gaps() {
        let mut q = full();
        q.environment.clear();
        assert_eq!(q.validate(), Err(QueryError::Gap("name")));
        assert_eq!(
            KiteQuery::default().validate(),
            Err(QueryError::MissingUsername)
        );
        assert_eq!(full().validate(), Ok(()));
    }

    #[test]
    fn matches_is_prefix_equality() {
        let kite = Kite {
            username: "u".into(),
            environment: "e".into(),
            name: "n".into(),
            version: "0.1.0".into(),
            region: "r".into(),
            hostname: "h".into(),
            id: "i".into(),
        };
        let mut q = KiteQuery {
            username: "u".into(),
            ..Default::default()
        };
        assert!(q.matches(&kite));
        q.environment = "staging".into();
        assert!(!q.matches(&kite));
    }

    #[test]
    fn version_constraint_detection() {
        let mut q = full();
        assert!(q.version_constraint().is_none()); // exact version
        q.version = ">=0.2.0, <1.0.0".into();
        let req = q.version_constraint().expect("range expression");
        assert!(req.matches(&Version::parse("0.2.0").unwrap()));
        assert!(!req.matches(&Version::parse("1.0.0").unwrap()));
        q.version.clear();
        assert!(q.version_constraint().is_none());
    }
}

//! Kite identity: the seven-field tuple that names a kite.

use serde::{Deserialize, Serialize};

use crate::query::KiteQuery;

/// A kite's identity. `username` through `id` form a canonical path
/// that doubles as the storage key and as the JWT audience scope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kite {
    pub username: String,
    pub environment: String,
    pub name: String,
    pub version: String,
    pub region: String,
    pub hostname: String,
    pub id: String,
}

impl Kite {
    /// A fresh identity with a random UUID id.
    pub fn new(
        username: impl Into<String>,
        environment: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        region: impl Into<String>,
        hostname: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            environment: environment.into(),
            name: name.into(),
            version: version.into(),
            region: region.into(),
            hostname: hostname.into(),
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

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

    /// The canonical path, e.g.
    /// `/devrim/production/mathworker/1.2.3/eu-west/tardis.local/<uuid>`.
    pub fn key(&self) -> String {
        let mut out = String::new();
        for field in self.fields() {
            out.push('/');
            out.push_str(field);
        }
        out
    }

    /// The exact query that matches only this kite.
    pub fn query(&self) -> KiteQuery {
        KiteQuery {
            username: self.username.clone(),
            environment: self.environment.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            region: self.region.clone(),
            hostname: self.hostname.clone(),
            id: self.id.clone(),
        }
    }

    /// Whether `audience` scopes this kite: `/` matches everything,
    /// otherwise every component of the audience path must equal the
    /// corresponding identity field.
    pub fn allows_audience(&self, audience: &str) -> bool {
        let components: Vec<&str> = audience.split('/').filter(|c| !c.is_empty()).collect();
        if components.len() > 7 {
            return false;
        }
        components
            .iter()
            .zip(self.fields().iter())
            .all(|(want, have)| want == have)
    }
}

impl std::fmt::Display for Kite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Kite {
        Kite {
            username: "devrim".into(),
            environment: "production".into(),
            name: "mathworker".into(),
            version: "1.2.3".into(),
            region: "eu-west".into(),
            hostname: "tardis.local".into(),
            id: "4f0c6b02".into(),
        }
    }

    #[test]
    fn key_is_slash_joined() {
        assert_eq!(
            sample().key(),
            "/devrim/production/mathworker/1.2.3/eu-west/tardis.local/4f0c6b02"
        );
    }

    #[test]
    fn audience_prefix_rules() {
        let k = sample();
        assert!(k.allows_audience("/"));
        assert!(k.allows_audience("/devrim"));
        assert!(k.allows_audience("/devrim/production/mathworker"));
        assert!(k.allows_audience(&k.key()));
        assert!(!k.allows_audience("/other"));
        assert!(!k.allows_audience("/devrim/staging"));
    }
}

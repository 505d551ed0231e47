//! Kite configuration, resolved from explicit settings, the kite-key
//! file, and `KITE_*` environment variables.

use std::time::Duration;

use kite_protocol::KiteClaims;
use kite_sockjs::Transport;

use crate::kitekey;

/// TLS material for the kite server, inline or from files.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_pem: String,
    pub key_pem: String,
}

impl TlsConfig {
    pub fn from_files(cert: &str, key: &str) -> std::io::Result<Self> {
        Ok(Self {
            cert_pem: std::fs::read_to_string(cert)?,
            key_pem: std::fs::read_to_string(key)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    // ── Identity ─────────────────────────────────────────────────────
    pub username: String,
    pub environment: String,
    pub name: String,
    pub version: String,
    pub region: String,
    pub hostname: String,
    pub id: String,

    // ── Server ───────────────────────────────────────────────────────
    /// Bind address. A kite has no default port; `0` picks an
    /// ephemeral one.
    pub ip: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,

    // ── Kontrol ──────────────────────────────────────────────────────
    pub kontrol_url: Option<String>,
    pub kontrol_user: String,
    /// Trusted kontrol public key (PEM).
    pub kontrol_key: Option<String>,
    /// This kite's kite key (JWT).
    pub kite_key: Option<String>,

    // ── Behavior ─────────────────────────────────────────────────────
    pub transport: Transport,
    pub disable_authentication: bool,
    /// Serialize method dispatch instead of spawning per message.
    pub disable_concurrency: bool,
    /// Relax same-session callback ordering.
    pub concurrent_callbacks: bool,
    /// Default `tell` timeout; `None` waits forever.
    pub tell_timeout: Option<Duration>,
    /// Static proxy override (`KITE_PROXY_URL`).
    pub proxy_url: Option<String>,
}

impl Config {
    /// A fresh config for a kite called `name` at `version`, with
    /// environment overrides applied.
    pub fn new(name: &str, version: &str) -> Self {
        let config = Self {
            username: std::env::var("USER").unwrap_or_else(|_| "unknown".into()),
            environment: "unconfigured".into(),
            name: name.to_string(),
            version: version.to_string(),
            region: "unconfigured".into(),
            hostname: hostname(),
            id: uuid::Uuid::new_v4().to_string(),
            ip: "0.0.0.0".into(),
            port: 0,
            tls: None,
            kontrol_url: None,
            kontrol_user: "kontrol".into(),
            kontrol_key: None,
            kite_key: None,
            transport: Transport::Auto,
            disable_authentication: false,
            disable_concurrency: false,
            concurrent_callbacks: false,
            tell_timeout: None,
            proxy_url: None,
        };
        config.apply_env()
    }

    /// Like [`new`](Self::new), but seeded from the kite-key file:
    /// username, kontrol user, kontrol URL, and the trust-anchor
    /// public key all come from the key's claims.
    pub fn from_kite_key(name: &str, version: &str) -> Result<Self, kitekey::KiteKeyError> {
        let token = kitekey::read()?;
        let claims = KiteClaims::peek(&token).ok_or(kitekey::KiteKeyError::Malformed)?;
        let mut config = Self::new(name, version);
        config.apply_claims(&token, &claims);
        Ok(config.apply_env())
    }

    /// Adopt a kite key handed over at runtime (e.g. from
    /// `registerMachine`).
    pub fn use_kite_key(&mut self, token: String) {
        if let Some(claims) = KiteClaims::peek(&token) {
            self.apply_claims(&token, &claims);
        }
    }

    fn apply_claims(&mut self, token: &str, claims: &KiteClaims) {
        self.kite_key = Some(token.to_string());
        if !claims.sub.is_empty() {
            self.username = claims.sub.clone();
        }
        if !claims.iss.is_empty() {
            self.kontrol_user = claims.iss.clone();
        }
        if let Some(url) = &claims.kontrol_url {
            self.kontrol_url = Some(url.clone());
        }
        if let Some(key) = &claims.kontrol_key {
            self.kontrol_key = Some(key.clone());
        }
    }

    fn apply_env(mut self) -> Self {
        if let Ok(url) = std::env::var("KONTROL_URL") {
            if !url.is_empty() {
                self.kontrol_url = Some(url);
            }
        }
        if let Ok(url) = std::env::var("KITE_PROXY_URL") {
            if !url.is_empty() {
                self.proxy_url = Some(url);
            }
        }
        self
    }
}

/// Best-effort machine hostname.
pub(crate) fn hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                if !name.is_empty() {
                    return name.to_string();
                }
            }
        }
    }
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

/// Initialize tracing for a kite binary. `KITE_LOG_LEVEL`
/// (`FATAL|ERROR|WARNING|INFO|DEBUG`) picks the default filter when
/// `RUST_LOG` is unset; `KITE_LOG_NOCOLOR` disables ANSI colors.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let default_level = match std::env::var("KITE_LOG_LEVEL")
        .unwrap_or_default()
        .to_ascii_uppercase()
        .as_str()
    {
        "FATAL" | "ERROR" => "error",
        "WARNING" => "warn",
        "DEBUG" => "debug",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    let no_color = std::env::var("KITE_LOG_NOCOLOR").is_ok();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_has_identity() {
        let config = Config::new("mathworker", "1.2.3");
        assert_eq!(config.name, "mathworker");
        assert_eq!(config.version, "1.2.3");
        assert!(!config.id.is_empty());
        assert!(!config.hostname.is_empty());
        assert_eq!(config.port, 0);
    }

    #[test]
    fn kite_key_claims_seed_the_config() {
        let mut config = Config::new("w", "0.1.0");
        let claims = KiteClaims {
            iss: "kontrol-user".into(),
            sub: "alice".into(),
            jti: "k".into(),
            kontrol_url: Some("http://127.0.0.1:4000/kite".into()),
            kontrol_key: Some("PEM".into()),
            ..Default::default()
        };
        config.apply_claims("token", &claims);
        assert_eq!(config.username, "alice");
        assert_eq!(config.kontrol_user, "kontrol-user");
        assert_eq!(config.kontrol_url.as_deref(), Some("http://127.0.0.1:4000/kite"));
        assert_eq!(config.kontrol_key.as_deref(), Some("PEM"));
        assert_eq!(config.kite_key.as_deref(), Some("token"));
    }
}

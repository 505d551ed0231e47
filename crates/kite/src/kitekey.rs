//! The kite-key file: a single-line JWT at `$KITE_HOME/kite.key`
//! (default `~/.kite/kite.key`), mode 0600.

use std::path::PathBuf;

use kite_protocol::KiteClaims;

#[derive(Debug, thiserror::Error)]
pub enum KiteKeyError {
    #[error("no home directory")]
    NoHome,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("kite key is not a valid jwt")]
    Malformed,
}

/// The kite directory: `$KITE_HOME` when set, `~/.kite` otherwise.
pub fn kite_home() -> Result<PathBuf, KiteKeyError> {
    if let Ok(home) = std::env::var("KITE_HOME") {
        if !home.is_empty() {
            return Ok(PathBuf::from(home));
        }
    }
    dirs::home_dir()
        .map(|home| home.join(".kite"))
        .ok_or(KiteKeyError::NoHome)
}

pub fn kite_key_path() -> Result<PathBuf, KiteKeyError> {
    Ok(kite_home()?.join("kite.key"))
}

/// Read and validate the shape of the kite key.
pub fn read() -> Result<String, KiteKeyError> {
    let raw = std::fs::read_to_string(kite_key_path()?)?;
    let token = raw.trim().to_string();
    if KiteClaims::peek(&token).is_none() {
        return Err(KiteKeyError::Malformed);
    }
    Ok(token)
}

/// Write the kite key with owner-only permissions.
pub fn write(token: &str) -> Result<(), KiteKeyError> {
    let path = kite_key_path()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, format!("{}\n", token.trim()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kite_home_honours_env() {
        // Serialize env mutation within this test only.
        let prev = std::env::var("KITE_HOME").ok();
        std::env::set_var("KITE_HOME", "/tmp/kite-home-test");
        assert_eq!(kite_home().unwrap(), PathBuf::from("/tmp/kite-home-test"));
        match prev {
            Some(v) => std::env::set_var("KITE_HOME", v),
            None => std::env::remove_var("KITE_HOME"),
        }
    }
}

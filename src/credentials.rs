//! Per-tenant upstream credential loading.
//!
//! Each tenant carries a `.env`-style credentials file under its storage
//! root with the three keys the upstream login flow needs. Provisioning the
//! file is an operator concern; this module only reads it.

use std::fs;
use std::path::Path;

use anyhow::Context;

/// Key holding the upstream account username.
const KEY_USERNAME: &str = "EMODAL_USERNAME";
/// Key holding the upstream account password.
const KEY_PASSWORD: &str = "EMODAL_PASSWORD";
/// Key holding the captcha-solver API key passed through to the upstream.
const KEY_CAPTCHA: &str = "CAPTCHA_API_KEY";

/// Upstream login credentials for one tenant.
#[derive(Clone)]
pub struct UpstreamCredentials {
    /// Account username on the target site.
    pub username: String,
    /// Account password.
    pub password: String,
    /// Captcha-solver API key the upstream uses during login.
    pub captcha_api_key: String,
}

impl std::fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("captcha_api_key", &"[REDACTED]")
            .finish()
    }
}

/// Load a tenant's upstream credentials from its credentials file.
///
/// # Errors
///
/// Returns an error if the file is missing, has group/other-readable
/// permissions, cannot be parsed, or lacks one of the required keys.
pub fn load_credentials(path: &Path) -> anyhow::Result<UpstreamCredentials> {
    if !path.exists() {
        return Err(anyhow::anyhow!(
            "credentials file does not exist: {}",
            path.display()
        ));
    }

    validate_private_permissions(path)?;

    let mut username = None;
    let mut password = None;
    let mut captcha_api_key = None;

    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;
    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        match key.as_str() {
            KEY_USERNAME => username = Some(value),
            KEY_PASSWORD => password = Some(value),
            KEY_CAPTCHA => captcha_api_key = Some(value),
            _ => {}
        }
    }

    let require = |value: Option<String>, key: &str| {
        value.ok_or_else(|| {
            anyhow::anyhow!("missing {key} in credentials file {}", path.display())
        })
    };

    Ok(UpstreamCredentials {
        username: require(username, KEY_USERNAME)?,
        password: require(password, KEY_PASSWORD)?,
        captcha_api_key: require(captcha_api_key, KEY_CAPTCHA)?,
    })
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

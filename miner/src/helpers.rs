//! Helper functions for the miner.
//!
//! # Key Management
//!
//! The miner's identity is an Ed25519 keypair stored at `<data_dir>/keypair.bin`.
//! - On first run, a new keypair is generated
//! - On subsequent runs, the existing keypair is loaded
//! - Corrupted or invalid keypairs cause a startup error (delete to regenerate)
//!
//! The account id the chain knows the miner by is the verifying key.

use std::path::Path;

use anyhow::Result;
use ed25519_dalek::SigningKey;
use tracing::{debug, warn};

/// Fresh signing key from OS randomness.
pub fn generate_signing_key() -> Result<SigningKey> {
    let mut secret = [0u8; 32];
    getrandom::fill(&mut secret).map_err(|e| anyhow::anyhow!("OS randomness unavailable: {e}"))?;
    Ok(SigningKey::from_bytes(&secret))
}

/// Load or generate keypair from disk
pub async fn load_keypair(keypair_path: &Path) -> Result<SigningKey> {
    if keypair_path.exists() {
        let bytes = tokio::fs::read(keypair_path).await?;
        let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            anyhow::anyhow!(
                "Corrupted keypair file at {}: expected 32 bytes, got {}. Delete the file to regenerate.",
                keypair_path.display(),
                bytes.len()
            )
        })?;
        debug!(path = %keypair_path.display(), "Loaded existing keypair");
        return Ok(SigningKey::from_bytes(&secret));
    }

    if let Some(parent) = keypair_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let key = generate_signing_key()?;
    tokio::fs::write(keypair_path, key.to_bytes()).await?;

    // Set restrictive permissions (0600) to prevent other users from reading the keypair
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        if let Err(e) = std::fs::set_permissions(keypair_path, perms) {
            warn!(path = %keypair_path.display(), error = %e, "Failed to set keypair file permissions");
        }
    }

    debug!(path = %keypair_path.display(), "Generated new keypair");
    Ok(key)
}

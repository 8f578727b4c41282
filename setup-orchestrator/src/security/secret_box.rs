// Credential encryption for the local snapshot
//
// - Values carry an `ENCv1:` prefix followed by base64(nonce || ciphertext).
// - AES-256-GCM with a random 96-bit nonce per value.
// - The key lives in a file next to the cache and is created lazily on first use.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::{Context, Result};
use base64::Engine;
use log::{info, warn};
use ring::rand::{SecureRandom, SystemRandom};
use std::io;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::models::state::SecretValue;

const ENC_PREFIX: &str = "ENCv1:";
const KEY_BYTES: usize = 32;
const NONCE_BYTES: usize = 12;

#[derive(Debug)]
pub struct SecretBox {
    key_path: PathBuf,
    key: OnceCell<[u8; KEY_BYTES]>,
}

impl SecretBox {
    pub fn new(key_path: PathBuf) -> Self {
        Self {
            key_path,
            key: OnceCell::new(),
        }
    }

    pub fn is_sealed(value: &str) -> bool {
        value.starts_with(ENC_PREFIX)
    }

    pub async fn seal(&self, secret: &SecretValue) -> Result<String> {
        let key = self.key().await?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow::anyhow!("Invalid AES-256 key length"))?;

        let mut nonce_bytes = [0u8; NONCE_BYTES];
        SystemRandom::new()
            .fill(&mut nonce_bytes)
            .map_err(|_| anyhow::anyhow!("Failed to generate nonce"))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.expose().as_bytes())
            .map_err(|_| anyhow::anyhow!("Secret encryption failed"))?;

        let mut blob = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(format!(
            "{}{}",
            ENC_PREFIX,
            base64::engine::general_purpose::STANDARD.encode(blob)
        ))
    }

    pub async fn open(&self, sealed: &str) -> Result<SecretValue> {
        let encoded = sealed
            .strip_prefix(ENC_PREFIX)
            .ok_or_else(|| anyhow::anyhow!("Value is not a sealed secret"))?;
        let blob = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .context("Failed to base64-decode sealed secret")?;
        if blob.len() <= NONCE_BYTES {
            anyhow::bail!("Sealed secret is too short");
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_BYTES);
        let key = self.key().await?;
        let cipher = Aes256Gcm::new_from_slice(key)
            .map_err(|_| anyhow::anyhow!("Invalid AES-256 key length"))?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| anyhow::anyhow!("Secret decryption failed"))?;
        let value = String::from_utf8(plaintext).context("Decrypted secret is not valid UTF-8")?;
        Ok(SecretValue::new(value))
    }

    async fn key(&self) -> Result<&[u8; KEY_BYTES]> {
        self.key
            .get_or_try_init(|| async {
                if tokio::fs::try_exists(&self.key_path).await.unwrap_or(false) {
                    return read_key(&self.key_path).await;
                }
                if let Some(parent) = self.key_path.parent() {
                    tokio::fs::create_dir_all(parent).await.with_context(|| {
                        format!("Failed to create key directory {}", parent.display())
                    })?;
                }

                let mut key_bytes = [0u8; KEY_BYTES];
                SystemRandom::new()
                    .fill(&mut key_bytes)
                    .map_err(|_| anyhow::anyhow!("Failed to generate secret key"))?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(key_bytes);

                let write_key = || async {
                    let mut file = tokio::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .open(&self.key_path)
                        .await?;
                    file.write_all(encoded.as_bytes()).await?;
                    file.sync_all().await?;
                    Ok::<(), io::Error>(())
                };
                let strategy = ExponentialBackoff::from_millis(50)
                    .factor(2)
                    .max_delay(std::time::Duration::from_millis(750))
                    .take(3)
                    .map(jitter);

                match RetryIf::spawn(strategy, write_key, is_transient_io_error).await {
                    Ok(()) => {
                        info!(
                            "[PHASE: security] [STEP: key] Created secret key at {}",
                            self.key_path.display()
                        );
                        Ok(key_bytes)
                    }
                    // Another process won the race; use its key.
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                        read_key(&self.key_path).await
                    }
                    Err(e) => {
                        warn!(
                            "[PHASE: security] [STEP: key] Could not persist secret key ({}); sealed values will not survive restart",
                            e
                        );
                        Ok(key_bytes)
                    }
                }
            })
            .await
    }
}

async fn read_key(path: &Path) -> Result<[u8; KEY_BYTES]> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read secret key file {}", path.display()))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(bytes.trim_ascii())
        .context("Failed to decode secret key file (base64)")?;
    if decoded.len() != KEY_BYTES {
        anyhow::bail!("Secret key file has invalid length (expected {KEY_BYTES} bytes)");
    }
    let mut key = [0u8; KEY_BYTES];
    key.copy_from_slice(&decoded);
    Ok(key)
}

fn is_transient_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    )
}

/// Key file location next to the state cache.
pub fn default_key_path(data_folder: &Path) -> PathBuf {
    data_folder.join("secrets").join("wizard_master_key.b64")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seal_then_open_restores_secret() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = SecretBox::new(default_key_path(dir.path()));
        let secret = SecretValue::new("sk-live-abcdefghijklmnop");

        let sealed = sealer.seal(&secret).await.unwrap();
        assert!(SecretBox::is_sealed(&sealed));
        assert!(!sealed.contains("abcdefghijklmnop"));
        assert_eq!(sealer.open(&sealed).await.unwrap(), secret);
    }

    #[tokio::test]
    async fn key_file_is_reused_by_a_second_instance() {
        let dir = tempfile::tempdir().unwrap();
        let path = default_key_path(dir.path());
        let sealed = SecretBox::new(path.clone())
            .seal(&SecretValue::new("token-123456789"))
            .await
            .unwrap();

        let reopened = SecretBox::new(path).open(&sealed).await.unwrap();
        assert_eq!(reopened.expose(), "token-123456789");
    }

    #[tokio::test]
    async fn nonces_differ_between_seals() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = SecretBox::new(default_key_path(dir.path()));
        let secret = SecretValue::new("same-secret-value");
        let a = sealer.seal(&secret).await.unwrap();
        let b = sealer.seal(&secret).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn tampered_values_fail_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let sealer = SecretBox::new(default_key_path(dir.path()));
        let sealed = sealer
            .seal(&SecretValue::new("sk-abcdefghijklmnop"))
            .await
            .unwrap();
        let mut tampered = sealed.clone();
        tampered.pop();
        tampered.push(if sealed.ends_with('A') { 'B' } else { 'A' });
        assert!(sealer.open(&tampered).await.is_err());
        assert!(sealer.open("plaintext").await.is_err());
    }
}

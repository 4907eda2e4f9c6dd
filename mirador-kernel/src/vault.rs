/**
 * CREDENTIAL VAULT - Protection des secrets d'équipements au repos
 *
 * RÔLE :
 * Chiffre/déchiffre les mots de passe API des routeurs stockés dans
 * l'inventaire. Clé symétrique unique chargée au démarrage, jamais loggée.
 *
 * FONCTIONNEMENT :
 * - AES-256-GCM, nonce aléatoire de 12 octets par chiffrement
 * - Format au repos : base64(nonce || ciphertext || tag)
 * - Un déchiffrement avec la mauvaise clé ou un texte altéré échoue avec
 *   VaultError, jamais de valeur de substitution
 *
 * SÉCURITÉ :
 * - Clé lue depuis MIRADOR_VAULT_KEY (32 octets en base64)
 * - Sans clé configurée : clé éphémère générée avec avertissement, les
 *   secrets stockés ne survivent pas au redémarrage
 */
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::warn;

pub const VAULT_KEY_ENV: &str = "MIRADOR_VAULT_KEY";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    #[error("vault key invalid: {0}")]
    InvalidKey(String),
    #[error("ciphertext malformed: {0}")]
    Malformed(String),
    #[error("ciphertext rejected (tampered or produced under a different key)")]
    Rejected,
}

/// Vault de secrets partageable entre tâches sans coordination :
/// aucun état mutable, seulement la clé en lecture seule.
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl CredentialVault {
    pub fn new(key: &[u8]) -> Result<Self, VaultError> {
        if key.len() != 32 {
            return Err(VaultError::InvalidKey(format!(
                "expected 32 bytes, got {}",
                key.len()
            )));
        }
        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        })
    }

    /// Charge la clé depuis l'environnement, ou génère une clé éphémère
    /// si aucune n'est configurée.
    pub fn from_env() -> Result<Self, VaultError> {
        match std::env::var(VAULT_KEY_ENV) {
            Ok(encoded) => {
                let key = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| VaultError::InvalidKey(format!("bad base64: {e}")))?;
                Self::new(&key)
            }
            Err(_) => {
                warn!(
                    "{VAULT_KEY_ENV} not set, generating an ephemeral key \
                     (stored secrets will not decrypt across restarts)"
                );
                let mut key = [0u8; 32];
                OsRng.fill_bytes(&mut key);
                Self::new(&key)
            }
        }
    }

    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .expect("AES-GCM seal");
        let mut raw = Vec::with_capacity(NONCE_LEN + sealed.len());
        raw.extend_from_slice(&nonce);
        raw.extend_from_slice(&sealed);
        BASE64.encode(raw)
    }

    pub fn decrypt(&self, ciphertext: &str) -> Result<String, VaultError> {
        let raw = BASE64
            .decode(ciphertext.trim())
            .map_err(|e| VaultError::Malformed(format!("bad base64: {e}")))?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::Malformed("payload too short".into()));
        }
        let (nonce, sealed) = raw.split_at(NONCE_LEN);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| VaultError::Rejected)?;
        String::from_utf8(plain).map_err(|_| VaultError::Malformed("secret is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault_with(byte: u8) -> CredentialVault {
        CredentialVault::new(&[byte; 32]).unwrap()
    }

    #[test]
    fn roundtrip() {
        let vault = vault_with(7);
        for secret in ["", "hunter2", "mot de passe très long avec accents é à ü"] {
            let sealed = vault.encrypt(secret);
            assert_eq!(vault.decrypt(&sealed).unwrap(), secret);
        }
    }

    #[test]
    fn same_secret_encrypts_differently() {
        // nonce aléatoire : deux chiffrements du même secret ne coïncident pas
        let vault = vault_with(7);
        assert_ne!(vault.encrypt("hunter2"), vault.encrypt("hunter2"));
    }

    #[test]
    fn tampered_ciphertext_rejected() {
        let vault = vault_with(7);
        let sealed = vault.encrypt("hunter2");
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        let tampered = BASE64.encode(raw);
        assert!(matches!(vault.decrypt(&tampered), Err(VaultError::Rejected)));
    }

    #[test]
    fn wrong_key_rejected() {
        let sealed = vault_with(7).encrypt("hunter2");
        assert!(matches!(
            vault_with(8).decrypt(&sealed),
            Err(VaultError::Rejected)
        ));
    }

    #[test]
    fn malformed_inputs_rejected() {
        let vault = vault_with(7);
        assert!(matches!(
            vault.decrypt("not//valid//base64!!"),
            Err(VaultError::Malformed(_))
        ));
        assert!(matches!(
            vault.decrypt(&BASE64.encode(b"short")),
            Err(VaultError::Malformed(_))
        ));
    }

    #[test]
    fn bad_key_length_refused() {
        assert!(matches!(
            CredentialVault::new(&[0u8; 16]),
            Err(VaultError::InvalidKey(_))
        ));
    }
}

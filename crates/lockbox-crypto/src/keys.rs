//! Key types and generation: file keys, master keys, the system key

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use lockbox_core::{VaultError, VaultResult};

use crate::KEY_SIZE;

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            /// Copy `bytes` straight into the key; `None` unless exactly 32 bytes.
            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                if bytes.len() != KEY_SIZE {
                    return None;
                }
                let mut key = Self { bytes: [0u8; KEY_SIZE] };
                key.bytes.copy_from_slice(bytes);
                Some(key)
            }

            /// Fill a zeroed key in place, so no copy of it outlives the key.
            pub fn fill_with(fill: impl FnOnce(&mut [u8; KEY_SIZE])) -> Self {
                let mut key = Self { bytes: [0u8; KEY_SIZE] };
                fill(&mut key.bytes);
                key
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// A per-file 256-bit encryption key. Zeroized on drop.
    FileKey
);

secret_key!(
    /// The caller-supplied 256-bit master key. Zeroized on drop.
    MasterKey
);

secret_key!(
    /// The install-local 256-bit system key. Zeroized on drop.
    SystemKey
);

impl MasterKey {
    /// Parse the text form of a master key: standard base64 of exactly 32 bytes.
    pub fn from_encoded(encoded: &SecretString) -> VaultResult<Self> {
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.expose_secret().trim())
                .map_err(|_| VaultError::InvalidMasterKey("not valid base64".into()))?,
        );

        Self::from_slice(&decoded).ok_or_else(|| {
            VaultError::InvalidMasterKey(format!(
                "expected {KEY_SIZE} bytes, got {}",
                decoded.len()
            ))
        })
    }

    /// Text form accepted by [`MasterKey::from_encoded`].
    pub fn to_encoded(&self) -> SecretString {
        SecretString::from(STANDARD.encode(self.bytes))
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    FileKey::fill_with(|bytes| rand::rngs::OsRng.fill_bytes(bytes))
}

/// Random 256 bits stretched through PBKDF2-HMAC-SHA512 with a random salt.
///
/// Used for both the system key and freshly generated master keys. The
/// iteration count makes a single call deliberately slow.
pub fn stretch_random_key(iterations: u32, salt_size: usize) -> Zeroizing<[u8; KEY_SIZE]> {
    let mut seed = Zeroizing::new([0u8; KEY_SIZE]);
    rand::rngs::OsRng.fill_bytes(seed.as_mut());

    let mut salt = vec![0u8; salt_size];
    rand::rngs::OsRng.fill_bytes(&mut salt);

    let mut derived = Zeroizing::new([0u8; KEY_SIZE]);
    pbkdf2::pbkdf2_hmac::<Sha512>(seed.as_ref(), &salt, iterations, derived.as_mut());
    salt.zeroize();
    derived
}

/// Generate a new master key and return its text form.
pub fn generate_master_key(iterations: u32) -> SecretString {
    let derived = stretch_random_key(iterations, 64);
    MasterKey::fill_with(|bytes| bytes.copy_from_slice(derived.as_ref())).to_encoded()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_key_generation() {
        let k1 = generate_file_key();
        let k2 = generate_file_key();
        assert_ne!(k1.as_bytes(), k2.as_bytes(), "random keys must differ");
    }

    #[test]
    fn test_master_key_encoded_roundtrip() {
        let master = MasterKey::from_bytes([7u8; KEY_SIZE]);
        let parsed = MasterKey::from_encoded(&master.to_encoded()).unwrap();
        assert_eq!(master.as_bytes(), parsed.as_bytes());
    }

    #[test]
    fn test_master_key_rejects_bad_input() {
        let not_b64 = SecretString::from("not base64 !!");
        assert!(matches!(
            MasterKey::from_encoded(&not_b64),
            Err(VaultError::InvalidMasterKey(_))
        ));

        let short = SecretString::from(STANDARD.encode([1u8; 16]));
        assert!(matches!(
            MasterKey::from_encoded(&short),
            Err(VaultError::InvalidMasterKey(_))
        ));
    }

    #[test]
    fn test_master_key_tolerates_whitespace() {
        let encoded = format!("  {}\n", STANDARD.encode([3u8; KEY_SIZE]));
        let parsed = MasterKey::from_encoded(&SecretString::from(encoded)).unwrap();
        assert_eq!(parsed.as_bytes(), &[3u8; KEY_SIZE]);
    }

    #[test]
    fn test_generate_master_key_is_parseable() {
        let encoded = generate_master_key(1_000);
        let key = MasterKey::from_encoded(&encoded).unwrap();
        let other = MasterKey::from_encoded(&generate_master_key(1_000)).unwrap();
        assert_ne!(key.as_bytes(), other.as_bytes());
    }

    #[test]
    fn test_from_slice_checks_length() {
        assert!(FileKey::from_slice(&[1u8; 31]).is_none());
        assert!(FileKey::from_slice(&[1u8; 33]).is_none());
        let key = FileKey::from_slice(&[1u8; KEY_SIZE]).unwrap();
        assert_eq!(key.as_bytes(), &[1u8; KEY_SIZE]);
    }

    #[test]
    fn test_fill_with_writes_in_place() {
        let key = SystemKey::fill_with(|bytes| bytes[0] = 0xAA);
        assert_eq!(key.as_bytes()[0], 0xAA);
        assert!(key.as_bytes()[1..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_debug_redacts() {
        let key = FileKey::from_bytes([0x41u8; KEY_SIZE]);
        let dbg = format!("{key:?}");
        assert!(dbg.contains("REDACTED"));
        assert!(!dbg.contains("65"));
    }
}

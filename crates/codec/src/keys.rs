use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::fmt;

pub(crate) const KEY_LEN: usize = 32;
pub(crate) const IV_LEN: usize = 16;

/// Key material for one backup: two AES-256 key/IV pairs and an HMAC secret.
#[derive(Clone, PartialEq, Eq)]
pub struct Keys {
    pub(crate) key1: [u8; KEY_LEN],
    pub(crate) iv1: [u8; IV_LEN],
    pub(crate) key2: [u8; KEY_LEN],
    pub(crate) iv2: [u8; IV_LEN],
    pub(crate) sign: Vec<u8>,
}

impl Keys {
    pub fn new(key1: [u8; KEY_LEN], iv1: [u8; IV_LEN], key2: [u8; KEY_LEN], iv2: [u8; IV_LEN], sign: Vec<u8>) -> Result<Self> {
        if sign.is_empty() {
            exn::bail!(ErrorKind::InvalidKey("signing key is empty".into()));
        }
        Ok(Self { key1, iv1, key2, iv2, sign })
    }

    /// Decode hex-encoded key material as stored in configuration.
    pub fn from_hex(key1: &str, iv1: &str, key2: &str, iv2: &str, sign: &str) -> Result<Self> {
        Self::new(
            Self::fixed("key1", key1)?,
            Self::fixed("iv1", iv1)?,
            Self::fixed("key2", key2)?,
            Self::fixed("iv2", iv2)?,
            hex::decode(sign.trim()).or_raise(|| ErrorKind::InvalidKey("sign is not valid hex".into()))?,
        )
    }

    /// Generate fresh random key material.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut rng = rand::thread_rng();
        let mut keys = Self {
            key1: [0; KEY_LEN],
            iv1: [0; IV_LEN],
            key2: [0; KEY_LEN],
            iv2: [0; IV_LEN],
            sign: vec![0; 64],
        };
        rng.fill_bytes(&mut keys.key1);
        rng.fill_bytes(&mut keys.iv1);
        rng.fill_bytes(&mut keys.key2);
        rng.fill_bytes(&mut keys.iv2);
        rng.fill_bytes(&mut keys.sign);
        keys
    }

    fn fixed<const N: usize>(field: &str, value: &str) -> Result<[u8; N]> {
        let bytes = hex::decode(value.trim()).or_raise(|| ErrorKind::InvalidKey(format!("{field} is not valid hex")))?;
        let len = bytes.len();
        bytes.try_into().map_err(|_| {
            exn::Exn::from(ErrorKind::InvalidKey(format!("{field} must be {N} bytes, got {len}")))
        })
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").finish_non_exhaustive()
    }
}

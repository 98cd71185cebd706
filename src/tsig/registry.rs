//! Key and algorithm tables.
//!
//! `tsig.c` keeps these as module-global linked lists populated by an init
//! function (`tsig_handler_init`). We replace that with an explicit
//! [`TsigRegistry`] value, built once at startup from configuration and
//! handed by reference to every component that signs or verifies (the
//! reactor's per-zone `xfrd` state, the outbound server, the NOTIFY
//! sender).

use std::collections::HashMap;

use base64::Engine as _;

use crate::config::TsigKeyConfig;

//----------- AlgorithmName -------------------------------------------------------

/// One of the three TSIG algorithms named in the external interfaces,
/// identified by its wire-form dname.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AlgorithmName {
    HmacMd5,
    HmacSha1,
    HmacSha256,
}

impl AlgorithmName {
    /// Parse a textual algorithm name, case-insensitively, optionally with
    /// a trailing dot as it would appear in wire form.
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim_end_matches('.');
        match name.to_ascii_lowercase().as_str() {
            "hmac-md5.sig-alg.reg.int" | "hmac-md5" => Some(Self::HmacMd5),
            "hmac-sha1" => Some(Self::HmacSha1),
            "hmac-sha256" => Some(Self::HmacSha256),
            _ => None,
        }
    }

    /// The wire-form dname clients and servers exchange.
    pub fn wire_name(self) -> &'static str {
        match self {
            AlgorithmName::HmacMd5 => "hmac-md5.sig-alg.reg.int.",
            AlgorithmName::HmacSha1 => "hmac-sha1.",
            AlgorithmName::HmacSha256 => "hmac-sha256.",
        }
    }

    pub fn max_digest_size(self) -> usize {
        match self {
            AlgorithmName::HmacMd5 => 16,
            AlgorithmName::HmacSha1 => 20,
            AlgorithmName::HmacSha256 => 32,
        }
    }
}

//----------- Algorithm -------------------------------------------------------------

/// An algorithm handle returned by [`TsigRegistry::algo_lookup`]: the name
/// plus an opaque HMAC context factory.
#[derive(Clone, Copy, Debug)]
pub struct Algorithm {
    pub name: AlgorithmName,
}

impl Algorithm {
    pub fn new(name: AlgorithmName) -> Self {
        Self { name }
    }

    /// Build a keyed HMAC context over this algorithm, ready to absorb
    /// wire bytes.
    pub fn context(self, secret: &[u8]) -> HmacContext {
        match self.name {
            AlgorithmName::HmacSha1 => {
                HmacContext::Ring(ring::hmac::Context::with_key(&ring::hmac::Key::new(
                    ring::hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
                    secret,
                )))
            }
            AlgorithmName::HmacSha256 => HmacContext::Ring(ring::hmac::Context::with_key(
                &ring::hmac::Key::new(ring::hmac::HMAC_SHA256, secret),
            )),
            AlgorithmName::HmacMd5 => HmacContext::Md5(HmacMd5::new(secret)),
        }
    }
}

/// A running HMAC computation. `ring` doesn't implement MD5 (deliberately:
/// it's broken as a general-purpose hash), so the legacy `hmac-md5`
/// algorithm routes through a small hand-rolled RFC 2104 construction over
/// the `md-5` crate's digest instead.
pub enum HmacContext {
    Ring(ring::hmac::Context),
    Md5(HmacMd5),
}

impl HmacContext {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            HmacContext::Ring(ctx) => ctx.update(data),
            HmacContext::Md5(ctx) => ctx.update(data),
        }
    }

    pub fn sign(self) -> Vec<u8> {
        match self {
            HmacContext::Ring(ctx) => ctx.sign().as_ref().to_vec(),
            HmacContext::Md5(ctx) => ctx.finish().to_vec(),
        }
    }
}

/// RFC 2104 HMAC over MD5, block size 64 octets.
pub struct HmacMd5 {
    ipad_hasher: md5::Md5,
    opad_key: [u8; 64],
}

impl HmacMd5 {
    pub fn new(secret: &[u8]) -> Self {
        use md5::Digest;

        let mut key_block = [0u8; 64];
        if secret.len() > 64 {
            let digest = md5::Md5::digest(secret);
            key_block[..16].copy_from_slice(&digest);
        } else {
            key_block[..secret.len()].copy_from_slice(secret);
        }

        let mut ipad_key = [0u8; 64];
        let mut opad_key = [0u8; 64];
        for i in 0..64 {
            ipad_key[i] = key_block[i] ^ 0x36;
            opad_key[i] = key_block[i] ^ 0x5c;
        }

        let mut ipad_hasher = md5::Md5::new();
        ipad_hasher.update(ipad_key);

        Self {
            ipad_hasher,
            opad_key,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        use md5::Digest;
        self.ipad_hasher.update(data);
    }

    pub fn finish(self) -> [u8; 16] {
        use md5::Digest;
        let inner_digest = self.ipad_hasher.finalize();

        let mut outer = md5::Md5::new();
        outer.update(self.opad_key);
        outer.update(inner_digest);
        outer.finalize().into()
    }
}

//----------- Key --------------------------------------------------------------------

/// A TSIG key: owner dname plus raw secret bytes.
#[derive(Clone)]
pub struct Key {
    pub name: String,
    pub secret: Vec<u8>,
    pub algorithm: AlgorithmName,
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Key")
            .field("name", &self.name)
            .field("algorithm", &self.algorithm)
            .field("secret", &"<redacted>")
            .finish()
    }
}

//----------- TsigRegistry ------------------------------------------------------------

/// Key and algorithm lookup tables, built once at startup and shared
/// (read-only) across the reactor, the outbound server, and the NOTIFY
/// sender.
///
/// Keyed by `(name, algorithm)` rather than just `name`, so an operator
/// can register the same key name under more than one algorithm while
/// rolling from e.g. hmac-sha1 to hmac-sha256 without downtime.
#[derive(Debug, Default)]
pub struct TsigRegistry {
    keys: HashMap<(String, AlgorithmName), Key>,
}

#[derive(Debug)]
pub enum RegistryError {
    UnknownAlgorithm(String),
    InvalidBase64(String),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::UnknownAlgorithm(a) => write!(f, "unknown TSIG algorithm {a:?}"),
            RegistryError::InvalidBase64(name) => {
                write!(f, "TSIG key {name:?} has invalid base64 secret")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

impl TsigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(keys: &[TsigKeyConfig]) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for key in keys {
            let algorithm = AlgorithmName::parse(&key.algorithm)
                .ok_or_else(|| RegistryError::UnknownAlgorithm(key.algorithm.clone()))?;
            let secret = base64::engine::general_purpose::STANDARD
                .decode(&key.secret)
                .map_err(|_| RegistryError::InvalidBase64(key.name.clone()))?;
            registry.register(Key {
                name: key.name.to_ascii_lowercase(),
                secret,
                algorithm,
            });
        }
        Ok(registry)
    }

    pub fn register(&mut self, key: Key) {
        self.keys
            .insert((key.name.to_ascii_lowercase(), key.algorithm), key);
    }

    /// Find a key by owner name and algorithm.
    pub fn key_lookup(&self, name: &str, algorithm: AlgorithmName) -> Option<&Key> {
        self.keys.get(&(name.to_ascii_lowercase(), algorithm))
    }

    /// Resolve a wire-form or textual algorithm name to a handle.
    pub fn algo_lookup(&self, name: &str) -> Option<Algorithm> {
        AlgorithmName::parse(name).map(Algorithm::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hmac_md5_matches_known_test_vector() {
        // RFC 2202 test case 1.
        let key = [0x0bu8; 16];
        let mut ctx = HmacMd5::new(&key);
        ctx.update(b"Hi There");
        let mac = ctx.finish();
        assert_eq!(
            mac,
            [
                0x92, 0x94, 0x72, 0x7a, 0x36, 0x38, 0xbb, 0x1c, 0x13, 0xf4, 0x8e, 0xf8, 0x15, 0x8b,
                0xfc, 0x9d
            ]
        );
    }

    #[test]
    fn registry_supports_multiple_algorithms_per_key_name() {
        let mut reg = TsigRegistry::new();
        reg.register(Key {
            name: "rolling-key.".into(),
            secret: vec![1, 2, 3],
            algorithm: AlgorithmName::HmacSha1,
        });
        reg.register(Key {
            name: "rolling-key.".into(),
            secret: vec![4, 5, 6],
            algorithm: AlgorithmName::HmacSha256,
        });

        assert!(reg
            .key_lookup("rolling-key.", AlgorithmName::HmacSha1)
            .is_some());
        assert!(reg
            .key_lookup("rolling-key.", AlgorithmName::HmacSha256)
            .is_some());
        assert!(reg
            .key_lookup("rolling-key.", AlgorithmName::HmacMd5)
            .is_none());
    }
}

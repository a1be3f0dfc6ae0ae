//! Account identities for nodes and contracts.
//!
//! Node accounts are derived deterministically from the local seed so that a
//! scenario re-run (or a restored snapshot) sees the same addresses.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::{plog_debug, Error, Result};

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A 20-byte ledger account address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub [u8; 20]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::Identity(format!("address must be 20 bytes, got {}", bytes.len())))?;
        Ok(Self(raw))
    }

    /// Lowercase `0x`-prefixed hex.
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Mixed-case checksummed form (EIP-55).
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = keccak256(lower.as_bytes());
        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (hash[i / 2] >> if i % 2 == 0 { 4 } else { 0 }) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }

    /// Looks like an address literal (`0x` followed by 40 hex digits).
    pub fn is_address_literal(s: &str) -> bool {
        s.len() == 42 && s.starts_with("0x") && s[2..].chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(trimmed)
            .map_err(|e| Error::Identity(format!("invalid address '{}': {}", s, e)))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for Address {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_checksum())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Secret key and address of one node account.
#[derive(Clone)]
pub struct NodeIdentity {
    secret: [u8; 32],
    address: Address,
}

impl NodeIdentity {
    pub fn from_secret(secret: [u8; 32]) -> Result<Self> {
        let key = libsecp256k1::SecretKey::parse(&secret)
            .map_err(|e| Error::Identity(format!("derived key is not a valid secret: {:?}", e)))?;
        let public = libsecp256k1::PublicKey::from_secret_key(&key).serialize();
        let hash = keccak256(&public[1..]);
        Ok(Self {
            secret,
            address: Address::from_slice(&hash[12..])?,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret)
    }

    /// Write the key file into `keystore_dir` and return its path.
    ///
    /// The file is a plain development keystore (address + hex secret);
    /// clients in a scenario run against throwaway test accounts only.
    pub fn write_keystore(&self, keystore_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(keystore_dir)?;
        let path = keystore_dir.join(format!("UTC--{}", hex::encode(self.address.0)));
        let document = serde_json::json!({
            "address": hex::encode(self.address.0),
            "private_key": self.secret_hex(),
            "version": 3,
        });
        fs::write(&path, serde_json::to_vec_pretty(&document)?)?;
        Ok(path)
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

/// Derive the identity of node `index`.
///
/// `run_number` is `None` when accounts are reused across runs.
pub fn derive_identity(
    seed: &str,
    scenario_name: &str,
    run_number: Option<u32>,
    index: usize,
) -> Result<NodeIdentity> {
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(scenario_name.as_bytes());
    if let Some(run) = run_number {
        hasher.update(run.to_string().as_bytes());
    }
    hasher.update(index.to_string().as_bytes());
    let secret: [u8; 32] = hasher.finalize().into();
    NodeIdentity::from_secret(secret)
}

/// Read the persistent local seed, generating and caching one if absent.
pub fn load_or_create_seed(path: &Path) -> Result<String> {
    if path.exists() {
        let seed = fs::read_to_string(path)?.trim().to_string();
        if seed.is_empty() {
            return Err(Error::Config(format!(
                "seed file {} is empty; delete it to generate a new seed",
                path.display()
            )));
        }
        return Ok(seed);
    }
    let bytes: [u8; 20] = rand::random();
    let seed = hex::encode(bytes);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, &seed)?;
    plog_debug!("Generated new local seed at {}", path.display());
    Ok(seed)
}

//! Keyed digests of preference values.
//!
//! A digest is HMAC-SHA256 keyed with the installation seed over the
//! length-prefixed device id, preference key and canonical JSON value. The
//! device id is left out of `Legacy` digests, which is what makes them
//! transplantable between machines and the reason they are migrated.

use crate::hash_store::HashStoreVersion;
use anyhow::{anyhow, Result};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

#[derive(Clone)]
pub struct DigestCalculator {
    mac: HmacSha256,
    device_id: String,
}

impl fmt::Debug for DigestCalculator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DigestCalculator")
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl DigestCalculator {
    pub fn new(seed: &[u8], device_id: &str) -> Result<Self> {
        let mac = HmacSha256::new_from_slice(seed).map_err(|e| anyhow!("mac init: {e}"))?;
        Ok(Self {
            mac,
            device_id: device_id.to_string(),
        })
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Hex digest of `value` stored under `key`. An absent value has a
    /// digest of its own so clearing a value is detectable.
    pub fn digest(&self, version: HashStoreVersion, key: &str, value: Option<&Value>) -> String {
        hex::encode(self.keyed(version, key, value).finalize().into_bytes())
    }

    /// Constant-time comparison against a stored hex digest.
    pub fn verify(
        &self,
        version: HashStoreVersion,
        key: &str,
        value: Option<&Value>,
        expected: &str,
    ) -> bool {
        let Ok(expected) = hex::decode(expected) else {
            return false;
        };
        self.keyed(version, key, value)
            .verify_slice(&expected)
            .is_ok()
    }

    fn keyed(&self, version: HashStoreVersion, key: &str, value: Option<&Value>) -> HmacSha256 {
        let mut mac = self.mac.clone();
        match version {
            HashStoreVersion::Legacy => {}
            HashStoreVersion::DeviceBound => update_field(&mut mac, self.device_id.as_bytes()),
        }
        update_field(&mut mac, key.as_bytes());
        update_field(&mut mac, canonical_value(value).as_bytes());
        mac
    }
}

fn update_field(mac: &mut HmacSha256, bytes: &[u8]) {
    mac.update(&(bytes.len() as u64).to_le_bytes());
    mac.update(bytes);
}

/// Compact JSON with object keys in sorted order; empty for an absent value.
pub fn canonical_value(value: Option<&Value>) -> String {
    match value {
        Some(v) => v.to_string(),
        None => String::new(),
    }
}

pub fn device_id_from_machine_id(machine_id: &str) -> String {
    let machine_id = machine_id.trim();
    if machine_id.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(machine_id.as_bytes());
    hex::encode(&digest[..8])
}

/// Stable per-machine id, or an empty string where none is available.
pub fn machine_device_id() -> String {
    match fs::read_to_string(MACHINE_ID_PATH) {
        Ok(raw) => device_id_from_machine_id(&raw),
        Err(err) => {
            debug!(error = %err, "machine id unavailable, using empty device id");
            String::new()
        }
    }
}

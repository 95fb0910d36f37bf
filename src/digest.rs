// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Content digests and per-platform digests.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Error;

const SHA256: &str = "sha256";

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Digest from a bare 64 character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, Error> {
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(hex.to_string()));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: crate::sha256_writer::sha256_hex(data),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(s.to_string()))?;
        if algorithm != SHA256 {
            return Err(Error::UnsupportedDigestAlgorithm(algorithm.to_string()));
        }
        Self::from_hex(hex).map_err(|_| Error::InvalidDigest(s.to_string()))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", SHA256, self.hex)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// The image backing one platform of a (possibly multi-arch) reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDigest {
    /// `os/arch` or `os/arch/variant`
    pub arch: String,
    pub digest: Digest,
}

impl PlatformDigest {
    pub fn new(arch: impl Into<String>, digest: Digest) -> Self {
        Self {
            arch: arch.into(),
            digest,
        }
    }
}

/// Format an OCI platform the way it appears in `Images.lock`.
pub fn platform_string(os: &str, architecture: &str, variant: Option<&str>) -> String {
    match variant {
        Some(v) if !v.is_empty() => format!("{}/{}/{}", os, architecture, v),
        _ => format!("{}/{}", os, architecture),
    }
}

/// Keep only the digests whose platform is in `filter`. An empty filter keeps everything.
pub fn filter_platforms(digests: Vec<PlatformDigest>, filter: &[String]) -> Vec<PlatformDigest> {
    if filter.is_empty() {
        return digests;
    }
    digests
        .into_iter()
        .filter(|d| filter.iter().any(|p| p == &d.arch))
        .collect()
}

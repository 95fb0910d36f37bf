// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Container image references.
//!
//! Parsing and registry defaulting (`docker.io`, `library/`, `latest`) are
//! those of [`oci_client::Reference`]; [`ImageReference`] adds the tag/digest
//! split and the naming helpers relocation needs.
use std::fmt;
use std::str::FromStr;

use oci_client::{ParseError, Reference};

use crate::digest::Digest;
use crate::error::Error;

/// Registry used when a reference names none.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference carries neither tag nor digest.
pub const DEFAULT_TAG: &str = "latest";

/// A registry-qualified image reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    Tag {
        host: String,
        repo: String,
        tag: String,
    },
    Digest {
        host: String,
        repo: String,
        digest: Digest,
        /// Tag written next to the digest, kept for display only.
        tag: Option<String>,
    },
}

impl ImageReference {
    pub fn parse(reference: &str) -> Result<Self, Error> {
        let reference = reference.trim();
        let parsed = Reference::try_from(reference).map_err(|e| match e {
            ParseError::DigestUnsupported => Error::UnsupportedDigestAlgorithm(
                reference
                    .rsplit_once('@')
                    .and_then(|(_, digest)| digest.split_once(':'))
                    .map_or_else(String::new, |(algorithm, _)| algorithm.to_string()),
            ),
            other => Error::InvalidReference {
                reference: reference.to_string(),
                reason: other.to_string(),
            },
        })?;
        Self::from_oci(&parsed)
    }

    /// Split a parsed reference into its tag or digest form.
    pub fn from_oci(reference: &Reference) -> Result<Self, Error> {
        let host = reference.registry().to_string();
        let repo = reference.repository().to_string();
        let tag = reference.tag().map(str::to_string);
        Ok(match reference.digest() {
            Some(digest) => ImageReference::Digest {
                host,
                repo,
                digest: digest.parse()?,
                tag,
            },
            None => ImageReference::Tag {
                host,
                repo,
                tag: tag.unwrap_or_else(|| DEFAULT_TAG.to_string()),
            },
        })
    }

    /// The reference as the registry client addresses it. A digest wins over
    /// a tag written next to it.
    pub fn to_oci(&self) -> Reference {
        match self {
            ImageReference::Tag { host, repo, tag } => {
                Reference::with_tag(host.clone(), repo.clone(), tag.clone())
            }
            ImageReference::Digest {
                host, repo, digest, ..
            } => Reference::with_digest(host.clone(), repo.clone(), digest.to_string()),
        }
    }

    pub fn host(&self) -> &str {
        match self {
            ImageReference::Tag { host, .. } | ImageReference::Digest { host, .. } => host,
        }
    }

    pub fn repo(&self) -> &str {
        match self {
            ImageReference::Tag { repo, .. } | ImageReference::Digest { repo, .. } => repo,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            ImageReference::Tag { tag, .. } => Some(tag),
            ImageReference::Digest { tag, .. } => tag.as_deref(),
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            ImageReference::Tag { .. } => None,
            ImageReference::Digest { digest, .. } => Some(digest),
        }
    }

    /// `host/repo`
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.host(), self.repo())
    }

    /// `:tag`, `@digest` or `:tag@digest`
    pub fn identifier(&self) -> String {
        match self {
            ImageReference::Tag { tag, .. } => format!(":{}", tag),
            ImageReference::Digest {
                digest,
                tag: Some(tag),
                ..
            } => format!(":{}@{}", tag, digest),
            ImageReference::Digest { digest, .. } => format!("@{}", digest),
        }
    }

    /// The tag, or the digest hex for digest references.
    pub fn tag_or_hex(&self) -> String {
        match self {
            ImageReference::Tag { tag, .. } => tag.clone(),
            ImageReference::Digest { tag: Some(tag), .. } => tag.clone(),
            ImageReference::Digest { digest, .. } => digest.hex().to_string(),
        }
    }

    /// Same repository, pinned to `digest`.
    pub fn with_digest(&self, digest: &Digest) -> Self {
        ImageReference::Digest {
            host: self.host().to_string(),
            repo: self.repo().to_string(),
            digest: digest.clone(),
            tag: None,
        }
    }

    /// Same repository, addressed by `tag`.
    pub fn with_tag(&self, tag: impl Into<String>) -> Self {
        ImageReference::Tag {
            host: self.host().to_string(),
            repo: self.repo().to_string(),
            tag: tag.into(),
        }
    }

    /// The repository path users actually wrote: the default namespace on the
    /// default registry is dropped.
    pub fn short_repo(&self) -> &str {
        let repo = self.repo();
        if self.host() == DEFAULT_REGISTRY {
            if let Some(rest) = repo.strip_prefix("library/") {
                if !rest.contains('/') {
                    return rest;
                }
            }
        }
        repo
    }

    /// The last `NAMESPACE/NAME` pair of the repository, or bare `NAME`.
    pub fn tail(&self) -> &str {
        let repo = self.short_repo();
        let mut slashes = repo.rmatch_indices('/');
        match (slashes.next(), slashes.next()) {
            (Some(_), Some((second, _))) => &repo[second + 1..],
            _ => repo,
        }
    }
}

impl FromStr for ImageReference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.canonical_name(), self.identifier())
    }
}

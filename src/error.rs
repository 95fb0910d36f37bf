// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Failure kinds shared across the wrap and unwrap pipelines.
use std::fmt;

/// Errors callers need to tell apart.
///
/// Everything else travels as a plain [`anyhow::Error`] with context attached.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("unsupported digest algorithm '{0}', only sha256 is supported")]
    UnsupportedDigestAlgorithm(String),

    #[error("invalid digest '{0}'")]
    InvalidDigest(String),

    #[error("unsupported media type '{media_type}' for {reference}")]
    UnsupportedMediaType {
        reference: String,
        media_type: String,
    },

    #[error("image {0} does not declare a platform")]
    MissingPlatform(String),

    #[error("no platforms left for {reference} after filtering by [{filter}]")]
    EmptyPlatformsAfterFilter { reference: String, filter: String },

    #[error("chart '{chart}' is missing dependencies [{}], run `helm dependency build` first", .missing.join(", "))]
    MissingDependencies { chart: String, missing: Vec<String> },

    #[error("tag {tag} does not exist in {repository}")]
    TagDoesNotExist { repository: String, tag: String },

    #[error("local artifact {0} does not exist")]
    LocalArtifactNotExist(String),

    #[error("OCI layout {path} holds {count} entries, expected exactly one")]
    MultipleLayoutEntries { path: String, count: usize },

    #[error("OCI layout {path} holds '{media_type}', expected an image manifest")]
    NotAnImageLayout { path: String, media_type: String },

    #[error("archive exceeds the maximum allowed size of {limit} bytes")]
    SizeExceeded { limit: u64 },

    #[error("wrap {0} does not exist")]
    WrapNotFound(String),

    #[error("Images.lock does not match the remote registry")]
    LockMismatch,

    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether repeating the failed operation can possibly succeed.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::InvalidReference { .. }
                | Error::UnsupportedDigestAlgorithm(_)
                | Error::InvalidDigest(_)
                | Error::UnsupportedMediaType { .. }
                | Error::MissingPlatform(_)
                | Error::EmptyPlatformsAfterFilter { .. }
                | Error::TagDoesNotExist { .. }
                | Error::LocalArtifactNotExist(_)
                | Error::MultipleLayoutEntries { .. }
                | Error::NotAnImageLayout { .. }
                | Error::Cancelled
        )
    }
}

/// Find the first [`Error`] in an error chain.
pub fn kind_of(err: &anyhow::Error) -> Option<&Error> {
    // Context layers are only visible through `anyhow::Error::downcast_ref`.
    err.downcast_ref::<Error>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<Error>()))
}

/// An error is retryable unless some link of its chain is a non-retryable [`Error`].
pub fn is_retryable(err: &anyhow::Error) -> bool {
    kind_of(err).map_or(true, Error::is_retryable)
}

pub fn is_tag_missing(err: &anyhow::Error) -> bool {
    matches!(kind_of(err), Some(Error::TagDoesNotExist { .. }))
}

pub fn is_local_artifact_missing(err: &anyhow::Error) -> bool {
    matches!(kind_of(err), Some(Error::LocalArtifactNotExist(_)))
}

/// Several independent failures reported together.
#[derive(Debug)]
pub struct ErrorList(pub Vec<anyhow::Error>);

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{:#}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

impl ErrorList {
    /// `Ok(())` when empty, the single error when alone, the joined list otherwise.
    pub fn join(mut errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ErrorList(errors).into()),
        }
    }

    /// The joined `errors`, or `fallback` when there are none. Used when a
    /// loop is interrupted so the failures seen before are not lost.
    pub fn gathered_or(errors: Vec<anyhow::Error>, fallback: anyhow::Error) -> anyhow::Error {
        match Self::join(errors) {
            Ok(()) => fallback,
            Err(gathered) => gathered,
        }
    }
}

/// Marks an error the section logger already printed in full.
#[derive(Debug, thiserror::Error)]
#[error("{summary}")]
pub struct LoggedError {
    summary: String,
    #[source]
    source: anyhow::Error,
}

impl LoggedError {
    pub fn new(summary: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            summary: summary.into(),
            source,
        }
    }
}

pub fn is_logged(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LoggedError>().is_some()
}

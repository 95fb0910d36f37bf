// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! State shared by every step of a command.
use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::registry::RegistryClient;
use crate::report::{Reporter, SilentReporter};
use crate::retry::{with_retries, DEFAULT_MAX_RETRIES};

/// Registry access, cancellation, retry policy and reporting for one invocation.
#[derive(Clone)]
pub struct Session {
    pub registry: Arc<dyn RegistryClient>,
    pub cancel: CancellationToken,
    pub reporter: Arc<dyn Reporter>,
    pub max_retries: u32,
}

impl Session {
    /// Silent session with a fresh cancellation token and the default retry count.
    pub fn new(registry: Arc<dyn RegistryClient>) -> Self {
        Self {
            registry,
            cancel: CancellationToken::new(),
            reporter: Arc::new(SilentReporter),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn reporter(&self) -> &dyn Reporter {
        self.reporter.as_ref()
    }

    /// Fail with [`Error::Cancelled`] once the token is tripped.
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled.into());
        }
        Ok(())
    }

    pub async fn retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        with_retries(&self.cancel, self.max_retries, what, op).await
    }
}

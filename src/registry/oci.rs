// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use http::HeaderValue;
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};
use tokio::io::AsyncWriteExt;

use super::auth::DockerConfig;
use super::{RawManifest, RegistryClient, RegistryOptions, MANIFEST_MEDIA_TYPES};
use crate::digest::Digest;
use crate::reference::ImageReference;

/// [`RegistryClient`] over `oci-client`.
pub struct OciRegistry {
    client: Client,
    options: RegistryOptions,
    docker_config: Option<DockerConfig>,
}

impl OciRegistry {
    pub fn new(options: RegistryOptions) -> Self {
        let config = ClientConfig {
            protocol: if options.plain_http {
                ClientProtocol::Http
            } else {
                ClientProtocol::Https
            },
            accept_invalid_certificates: options.insecure,
            ..Default::default()
        };
        let docker_config = match DockerConfig::load_default() {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring unreadable docker config");
                None
            }
        };
        Self {
            client: Client::new(config),
            options,
            docker_config,
        }
    }

    fn auth_for(&self, host: &str) -> RegistryAuth {
        if let (Some(user), Some(pass)) = (&self.options.username, &self.options.password) {
            return RegistryAuth::Basic(user.clone(), pass.clone());
        }
        match self.docker_config.as_ref().and_then(|c| c.get(host)) {
            Some((user, pass)) => RegistryAuth::Basic(user, pass),
            None => RegistryAuth::Anonymous,
        }
    }

    async fn authenticate(
        &self,
        reference: &ImageReference,
        operation: RegistryOperation,
    ) -> Result<(Reference, RegistryAuth)> {
        let oci_ref = reference.to_oci();
        let auth = self.auth_for(reference.host());
        self.client
            .auth(&oci_ref, &auth, operation)
            .await
            .context(format!("Failed to authenticate against {}", reference.host()))?;
        Ok((oci_ref, auth))
    }
}

#[async_trait]
impl RegistryClient for OciRegistry {
    async fn fetch_manifest(&self, reference: &ImageReference) -> Result<RawManifest> {
        let oci_ref = reference.to_oci();
        let auth = self.auth_for(reference.host());
        let (bytes, served_digest) = self
            .client
            .pull_manifest_raw(&oci_ref, &auth, &MANIFEST_MEDIA_TYPES)
            .await
            .context(format!("Failed to fetch manifest of {}", reference))?;
        let bytes = bytes.to_vec();
        let digest = Digest::of(&bytes);
        if served_digest != digest.to_string() {
            tracing::debug!(%reference, %served_digest, computed = %digest, "Registry reported a different manifest digest");
        }
        Ok(RawManifest::new(bytes, digest))
    }

    async fn resolve_digest(&self, reference: &ImageReference) -> Result<Digest> {
        if let Some(digest) = reference.digest() {
            return Ok(digest.clone());
        }
        let oci_ref = reference.to_oci();
        let auth = self.auth_for(reference.host());
        let digest = self
            .client
            .fetch_manifest_digest(&oci_ref, &auth)
            .await
            .context(format!("Failed to resolve {}", reference))?;
        Ok(digest.parse()?)
    }

    async fn pull_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        dest: &Path,
    ) -> Result<()> {
        let (oci_ref, _) = self.authenticate(reference, RegistryOperation::Pull).await?;
        let mut file = tokio::fs::File::create(dest)
            .await
            .context(format!("Failed to create `{}`", dest.display()))?;
        self.client
            .pull_blob(&oci_ref, digest.to_string().as_str(), &mut file)
            .await
            .context(format!("Failed to pull blob {} from {}", digest, reference))?;
        file.flush().await?;
        Ok(())
    }

    async fn push_blob(
        &self,
        reference: &ImageReference,
        digest: &Digest,
        data: Vec<u8>,
    ) -> Result<()> {
        let (oci_ref, _) = self.authenticate(reference, RegistryOperation::Push).await?;
        let digest = digest.to_string();
        // Registries accept re-uploads of content they hold already.
        self.client
            .push_blob(&oci_ref, &data, &digest)
            .await
            .context(format!("Failed to push blob {} to {}", digest, reference))?;
        Ok(())
    }

    async fn push_manifest(
        &self,
        reference: &ImageReference,
        bytes: Vec<u8>,
        media_type: &str,
    ) -> Result<Digest> {
        let (oci_ref, _) = self.authenticate(reference, RegistryOperation::Push).await?;
        let digest = Digest::of(&bytes);
        let url = self
            .client
            .push_manifest_raw(&oci_ref, bytes, HeaderValue::from_str(media_type)?)
            .await
            .context(format!("Failed to push manifest to {}", reference))?;
        tracing::debug!(%reference, %url, %digest, "Pushed manifest");
        Ok(digest)
    }

    async fn list_tags(&self, reference: &ImageReference) -> Result<Vec<String>> {
        let oci_ref = reference.to_oci();
        let auth = self.auth_for(reference.host());
        let response = self
            .client
            .list_tags(&oci_ref, &auth, None, None)
            .await
            .context(format!("Failed to list tags of {}", reference.canonical_name()))?;
        Ok(response.tags)
    }
}

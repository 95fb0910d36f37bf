// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Docker-style credential store.
//!
//! Reads and edits `config.json` in the directory named by `DOCKER_CONFIG`
//! (default `~/.docker`). Writes go through a temporary file and a rename.
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};

/// Key Docker Hub credentials are stored under.
pub const DOCKER_HUB_AUTH_KEY: &str = "https://index.docker.io/v1/";

const CONFIG_FILE: &str = "config.json";

/// A docker `config.json`, kept as a JSON object so unknown fields survive edits.
pub struct DockerConfig {
    path: PathBuf,
    doc: Map<String, Value>,
}

impl DockerConfig {
    /// The config named by `DOCKER_CONFIG`, or `~/.docker/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(dir) = std::env::var_os("DOCKER_CONFIG") {
            return Ok(PathBuf::from(dir).join(CONFIG_FILE));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| anyhow!("Cannot determine home directory for docker config"))?;
        Ok(home.join(".docker").join(CONFIG_FILE))
    }

    /// Load the default config; a missing file is an empty config.
    pub fn load_default() -> Result<Self> {
        Self::load(Self::default_path()?)
    }

    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.exists() {
            return Ok(Self {
                path,
                doc: Map::new(),
            });
        }
        let data = std::fs::read_to_string(&path)
            .context(format!("Failed to read docker config `{}`", path.display()))?;
        let doc = match serde_json::from_str(&data)
            .context(format!("Failed to parse docker config `{}`", path.display()))?
        {
            Value::Object(doc) => doc,
            _ => return Err(anyhow!("docker config `{}` is not an object", path.display())),
        };
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(username, password)` stored for `server`.
    pub fn get(&self, server: &str) -> Option<(String, String)> {
        let auths = self.doc.get("auths")?.as_object()?;
        let entry = auths.get(&auth_key(server)).or_else(|| {
            auths
                .iter()
                .find(|(k, _)| strip_scheme(k) == strip_scheme(server))
                .map(|(_, v)| v)
        })?;
        let encoded = entry.get("auth")?.as_str()?;
        let decoded = String::from_utf8(STANDARD.decode(encoded).ok()?).ok()?;
        let (user, pass) = decoded.split_once(':')?;
        Some((user.to_string(), pass.to_string()))
    }

    pub fn set(&mut self, server: &str, username: &str, password: &str) {
        let auths = self
            .doc
            .entry("auths")
            .or_insert_with(|| Value::Object(Map::new()));
        if !auths.is_object() {
            *auths = Value::Object(Map::new());
        }
        if let Value::Object(auths) = auths {
            let encoded = STANDARD.encode(format!("{}:{}", username, password));
            auths.insert(auth_key(server), serde_json::json!({ "auth": encoded }));
        }
    }

    /// Forget `server`. Returns whether an entry existed.
    pub fn remove(&mut self, server: &str) -> bool {
        self.doc
            .get_mut("auths")
            .and_then(Value::as_object_mut)
            .map_or(false, |auths| auths.remove(&auth_key(server)).is_some())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).context(format!(
                "Failed to create docker config directory `{}`",
                parent.display()
            ))?;
        }
        let tmp_path = self.path.with_extension("tmp");
        let data = serde_json::to_string_pretty(&self.doc)?;
        std::fs::write(&tmp_path, data)
            .context(format!("Failed to write `{}`", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path).context(format!(
            "Failed to rename `{}` to `{}`",
            tmp_path.display(),
            self.path.display()
        ))?;
        Ok(())
    }
}

fn strip_scheme(server: &str) -> &str {
    let server = server
        .strip_prefix("https://")
        .or_else(|| server.strip_prefix("http://"))
        .unwrap_or(server);
    server.trim_end_matches('/')
}

/// The `auths` key for `server`; every Docker Hub alias maps to the legacy index URL.
pub fn auth_key(server: &str) -> String {
    let host = strip_scheme(server);
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "docker.io" | "index.docker.io" | "registry-1.docker.io" | "" => {
            DOCKER_HUB_AUTH_KEY.to_string()
        }
        _ => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn docker_hub_uses_the_legacy_key() {
        assert_eq!(auth_key("docker.io"), DOCKER_HUB_AUTH_KEY);
        assert_eq!(auth_key("https://index.docker.io/v1/"), DOCKER_HUB_AUTH_KEY);
        assert_eq!(auth_key("ghcr.io"), "ghcr.io");
        assert_eq!(auth_key("https://localhost:5000/"), "localhost:5000");
    }

    #[test]
    fn login_logout_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"credsStore":"desktop","auths":{}}"#).unwrap();

        let mut config = DockerConfig::load(&path).unwrap();
        config.set("docker.io", "user", "s3cr:t");
        config.set("registry.example", "bot", "token");
        config.save().unwrap();

        let config = DockerConfig::load(&path).unwrap();
        assert_eq!(
            config.get("index.docker.io"),
            Some(("user".to_string(), "s3cr:t".to_string()))
        );
        assert_eq!(
            config.get("https://registry.example"),
            Some(("bot".to_string(), "token".to_string()))
        );
        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["credsStore"], "desktop");
        assert!(raw["auths"][DOCKER_HUB_AUTH_KEY]["auth"].is_string());

        let mut config = DockerConfig::load(&path).unwrap();
        assert!(config.remove("docker.io"));
        assert!(!config.remove("docker.io"));
        config.save().unwrap();
        assert!(DockerConfig::load(&path).unwrap().get("docker.io").is_none());
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let config = DockerConfig::load(dir.path().join("config.json")).unwrap();
        assert!(config.get("ghcr.io").is_none());
    }
}

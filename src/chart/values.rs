// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.
//! Image elements inside values documents.
//!
//! An element is any mapping holding a string `repository` key, optionally
//! next to `registry`, `tag` and `digest`.
use std::fmt;

use serde_yml::{Mapping, Value};

const REGISTRY: &str = "registry";
const REPOSITORY: &str = "repository";
const TAG: &str = "tag";
const DIGEST: &str = "digest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Location of a node inside a values tree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValuePath(pub Vec<PathSegment>);

impl ValuePath {
    fn child(&self, segment: PathSegment) -> Self {
        let mut path = self.0.clone();
        path.push(segment);
        Self(path)
    }
}

impl fmt::Display for ValuePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "$")?;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(key) => write!(f, ".{}", key)?,
                PathSegment::Index(i) => write!(f, "[{}]", i)?,
            }
        }
        Ok(())
    }
}

/// An image found in a values document, with the keys it was written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueImage {
    pub path: ValuePath,
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ValueImage {
    /// `[REGISTRY/]REPOSITORY[:TAG][@DIGEST]`
    pub fn url(&self) -> String {
        let mut url = String::new();
        if let Some(registry) = self.registry.as_deref().filter(|r| !r.is_empty()) {
            url.push_str(registry);
            url.push('/');
        }
        url.push_str(&self.repository);
        if let Some(tag) = self.tag.as_deref().filter(|t| !t.is_empty()) {
            url.push(':');
            url.push_str(tag);
        }
        if let Some(digest) = self.digest.as_deref().filter(|d| !d.is_empty()) {
            url.push('@');
            url.push_str(digest);
        }
        url
    }

    /// Last segment of the repository, used as a display name.
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Point the element at `name` (a repository without identifier).
    ///
    /// Only the keys present when the element was found are written: with a
    /// `registry` key the host goes there, otherwise `repository` gets it all.
    pub fn set_name(&mut self, name: &str) {
        match (&self.registry, name.split_once('/')) {
            (Some(_), Some((registry, repository))) => {
                self.registry = Some(registry.to_string());
                self.repository = repository.to_string();
            }
            _ => self.repository = name.to_string(),
        }
    }

    /// Write `registry`/`repository` back into `doc` at this element's path.
    pub fn write_back(&self, doc: &mut Value) -> bool {
        let Some(mapping) = mapping_at(doc, &self.path) else {
            return false;
        };
        mapping.insert(Value::from(REPOSITORY), Value::from(self.repository.clone()));
        if let Some(registry) = &self.registry {
            mapping.insert(Value::from(REGISTRY), Value::from(registry.clone()));
        }
        true
    }
}

/// Every image element of `doc`, in document order.
pub fn find_images(doc: &Value) -> Vec<ValueImage> {
    let mut images = Vec::new();
    walk(doc, &ValuePath::default(), &mut images);
    images
}

fn walk(node: &Value, path: &ValuePath, images: &mut Vec<ValueImage>) {
    match node {
        Value::Mapping(mapping) => {
            if let Some(image) = as_image(mapping, path) {
                images.push(image);
                return;
            }
            for (key, child) in mapping {
                if let Some(key) = scalar(key) {
                    walk(child, &path.child(PathSegment::Key(key)), images);
                }
            }
        }
        Value::Sequence(items) => {
            for (i, child) in items.iter().enumerate() {
                walk(child, &path.child(PathSegment::Index(i)), images);
            }
        }
        Value::Tagged(tagged) => walk(&tagged.value, path, images),
        _ => {}
    }
}

fn as_image(mapping: &Mapping, path: &ValuePath) -> Option<ValueImage> {
    let repository = match mapping.get(REPOSITORY) {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => return None,
    };
    let field = |key: &str| mapping.get(key).and_then(scalar);
    Some(ValueImage {
        path: path.clone(),
        registry: field(REGISTRY),
        repository,
        tag: field(TAG),
        digest: field(DIGEST),
    })
}

/// Strings and numbers as text (`tag: 1.0` is a valid tag).
fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn mapping_at<'a>(doc: &'a mut Value, path: &ValuePath) -> Option<&'a mut Mapping> {
    let mut node = untagged(doc);
    for segment in &path.0 {
        let child = match segment {
            PathSegment::Key(key) => node.as_mapping_mut()?.get_mut(key.as_str())?,
            PathSegment::Index(i) => node.as_sequence_mut()?.get_mut(*i)?,
        };
        node = untagged(child);
    }
    node.as_mapping_mut()
}

fn untagged(node: &mut Value) -> &mut Value {
    match node {
        Value::Tagged(tagged) => &mut tagged.value,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALUES: &str = r#"
image:
  registry: docker.io
  repository: redpandadata/redpanda
  tag: latest
sidecars:
  - name: exporter
    image:
      repository: quay.io/jetstack/cert-manager-controller
      tag: 1.0
helm:
  repository: https://charts.example
  other: [1, 2]
replicas: 3
"#;

    #[test]
    fn finds_elements_with_paths() {
        let doc: Value = serde_yml::from_str(VALUES).unwrap();
        let images = find_images(&doc);
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].path.to_string(), "$.image");
        assert_eq!(images[0].url(), "docker.io/redpandadata/redpanda:latest");
        assert_eq!(images[1].path.to_string(), "$.sidecars[0].image");
        assert_eq!(images[1].url(), "quay.io/jetstack/cert-manager-controller:1.0");
        assert_eq!(images[1].short_name(), "cert-manager-controller");
        assert_eq!(images[2].path.to_string(), "$.helm");
    }

    #[test]
    fn writes_back_only_present_keys() {
        let mut doc: Value = serde_yml::from_str(VALUES).unwrap();
        let mut images = find_images(&doc);

        images[0].set_name("ecr.example/kafka/redpandadata/redpanda");
        assert!(images[0].write_back(&mut doc));
        images[1].set_name("ecr.example/jetstack/cert-manager-controller");
        assert!(images[1].write_back(&mut doc));

        let image = &doc["image"];
        assert_eq!(image["registry"].as_str(), Some("ecr.example"));
        assert_eq!(image["repository"].as_str(), Some("kafka/redpandadata/redpanda"));
        assert_eq!(image["tag"].as_str(), Some("latest"));
        assert!(image.get("digest").is_none());

        let sidecar = &doc["sidecars"][0]["image"];
        assert_eq!(
            sidecar["repository"].as_str(),
            Some("ecr.example/jetstack/cert-manager-controller")
        );
        assert!(sidecar.get("registry").is_none());
    }
}

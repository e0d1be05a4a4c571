use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Media types offered when asking a registry for a manifest.
pub const ACCEPTED_MEDIA_TYPES: [&str; 4] =
    [DOCKER_MANIFEST_LIST, OCI_INDEX, DOCKER_MANIFEST, OCI_MANIFEST];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(rename = "os.version", default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default)]
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A single platform image: one config blob plus its layers.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// A multi platform image: references to one manifest per platform.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestList {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

/// Comparable snapshot of what a tag currently points at.
///
/// Two fingerprints are equal when the documents are structurally equal, so a
/// retag onto new layers or a new platform in a list is seen as a change.
/// Serializes as the manifest document itself.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum ManifestFingerprint {
    Manifest(ImageManifest),
    List(ManifestList),
}

impl ManifestFingerprint {
    /// Decodes a manifest response, trusting the `Content-Type` when it names a
    /// known manifest type and falling back to the document shape otherwise.
    pub fn parse(content_type: Option<&str>, body: &[u8]) -> Result<Self, serde_json::Error> {
        let media_type = content_type
            .and_then(|value| value.split(';').next())
            .map(str::trim);

        match media_type {
            Some(DOCKER_MANIFEST_LIST) | Some(OCI_INDEX) => {
                Ok(ManifestFingerprint::List(serde_json::from_slice(body)?))
            }
            Some(DOCKER_MANIFEST) | Some(OCI_MANIFEST) => {
                Ok(ManifestFingerprint::Manifest(serde_json::from_slice(body)?))
            }
            _ => serde_json::from_slice(body),
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, ManifestFingerprint::List(_))
    }

    /// Platforms referenced by a manifest list, as `os/arch[/variant]`.
    pub fn platforms(&self) -> Vec<String> {
        match self {
            ManifestFingerprint::Manifest(_) => vec![],
            ManifestFingerprint::List(list) => list
                .manifests
                .iter()
                .filter_map(|m| m.platform.as_ref())
                .map(|p| match &p.variant {
                    Some(variant) => format!("{}/{}/{}", p.os, p.architecture, variant),
                    None => format!("{}/{}", p.os, p.architecture),
                })
                .collect(),
        }
    }
}

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Registry that `kubeadm` expects its control plane images to come from.
pub const KUBEADM_REPO: &str = "k8s.gcr.io";

/// A single image tag in some registry, e.g. `gcr.io/google-containers/pause:3.2`.
///
/// The string form is the cache key and the log identity, and images order
/// by it so that repeated runs dispatch (and batch) in the same sequence.
#[derive(Clone, Debug, Hash, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub struct Image {
    pub repo: String,
    pub user: String,
    pub name: String,
    pub tag: String,
}

impl Image {
    pub fn new(repo: &str, user: &str, name: &str, tag: &str) -> Self {
        Image {
            repo: repo.to_string(),
            user: user.to_string(),
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }

    /// Repository path below the registry host, as used in `/v2/<path>/...` urls.
    pub fn path(&self) -> String {
        if self.user.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.user, self.name)
        }
    }

    /// Flattens the full source location into a single repository name so
    /// that images from different upstreams can live under one account.
    ///
    /// `gcr.io/google-containers/pause` becomes `gcr.io_google-containers_pause`,
    /// or `k8s.gcr.io_pause` when `kubeadm` naming is requested.
    pub fn merge_name(&self, kubeadm: bool) -> String {
        if kubeadm {
            return format!("{KUBEADM_REPO}/{}", self.name).replace('/', "_");
        }

        let mut merged = self.repo.clone();
        if !self.user.is_empty() {
            merged.push('/');
            merged.push_str(&self.user);
        }
        merged.push('/');
        merged.push_str(&self.name);
        merged.replace('/', "_")
    }

    /// Where this image lands in the destination registry.
    pub fn destination(&self, registry: &str, user: &str, kubeadm: bool) -> Image {
        Image::new(registry, user, &self.merge_name(kubeadm), &self.tag)
    }
}

impl Ord for Image {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for Image {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorts by string form and drops duplicates, giving the dispatch order.
pub fn dispatch_order(mut images: Vec<Image>) -> Vec<Image> {
    images.sort();
    images.dedup();
    images
}

impl FromStr for Image {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (location, tag) = match s.rsplit_once(':') {
            Some((location, tag)) if !tag.contains('/') => (location, tag),
            _ => return Err("image reference has no tag"),
        };

        let (repo, path) = location
            .split_once('/')
            .ok_or("image reference has no registry")?;

        let (user, name) = match path.split_once('/') {
            Some((user, name)) => (user, name),
            None => ("", path),
        };

        if repo.is_empty() || name.is_empty() || tag.is_empty() {
            return Err("image reference has an empty component");
        }

        Ok(Image::new(repo, user, name, tag))
    }
}

// We implement this so that serde_json can parse an Image from a straight string
impl TryFrom<String> for Image {
    type Error = &'static str;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Image> for String {
    fn from(image: Image) -> Self {
        image.to_string()
    }
}

impl fmt::Display for Image {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            write!(f, "{}/{}:{}", self.repo, self.name, self.tag)
        } else {
            write!(f, "{}/{}/{}:{}", self.repo, self.user, self.name, self.tag)
        }
    }
}

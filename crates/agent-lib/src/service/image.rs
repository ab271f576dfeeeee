//! Image reference parsing

use serde::{Deserialize, Serialize};
use std::fmt;

const DEFAULT_TAG: &str = "latest";

/// A parsed `name[:tag][@digest]` image reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    pub name: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference. A `:` is only treated as a tag separator
    /// when it appears after the last `/`, so registry ports survive.
    pub fn parse(reference: &str) -> Self {
        let reference = reference.trim();
        let (rest, digest) = match reference.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.to_string())),
            None => (reference, None),
        };

        let path_start = rest.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match rest[path_start..].rfind(':') {
            Some(i) => {
                let split = path_start + i;
                (rest[..split].to_string(), Some(rest[split + 1..].to_string()))
            }
            None => (rest.to_string(), None),
        };

        Self { name, tag, digest }
    }

    /// Tag, falling back to `latest`
    pub fn tag_or_default(&self) -> &str {
        self.tag.as_deref().unwrap_or(DEFAULT_TAG)
    }

    /// `name:tag` form used for pulls and registry lookups
    pub fn tagged(&self) -> String {
        format!("{}:{}", self.name, self.tag_or_default())
    }

    /// True when both references name the same repository, ignoring tag and digest
    pub fn same_repository(&self, other: &ImageRef) -> bool {
        normalize(&self.name) == normalize(&other.name)
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Strip the implicit Docker Hub prefixes so `nginx` and
/// `docker.io/library/nginx` compare equal
fn normalize(name: &str) -> &str {
    let name = name.strip_prefix("docker.io/").unwrap_or(name);
    name.strip_prefix("library/").unwrap_or(name)
}

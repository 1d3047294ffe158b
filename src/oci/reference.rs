//! Image reference parsing: `"<name>:<tag>"`, optionally prefixed with a
//! registry host (`ghcr.io/trycua/macos-sequoia-vanilla:latest`).

use crate::error::{PullError, Result};

pub const DEFAULT_REGISTRY: &str = "ghcr.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry host, e.g. `ghcr.io`.
    pub registry: String,
    /// Full repository path, e.g. `trycua/macos-sequoia-vanilla`.
    pub repository: String,
    /// Tag, e.g. `latest`.
    pub tag: String,
}

impl ImageReference {
    /// Parses `"<name>:<tag>"`, failing with `InvalidImageSpec` when empty or
    /// missing a tag (§4.5 step 1).
    pub fn parse(image: &str) -> Result<Self> {
        if image.is_empty() {
            return Err(PullError::invalid_image_spec(image, "image spec is empty"));
        }

        let (name, tag) = image
            .rsplit_once(':')
            .filter(|(_, tag)| !tag.is_empty() && !tag.contains('/'))
            .ok_or_else(|| PullError::invalid_image_spec(image, "missing `:tag` suffix"))?;

        if name.is_empty() {
            return Err(PullError::invalid_image_spec(image, "missing repository name"));
        }

        let (registry, repository) = split_registry(name);

        Ok(Self {
            registry,
            repository: repository.to_string(),
            tag: tag.to_string(),
        })
    }

    /// The first path segment of the repository, used as the cache
    /// organization directory (`trycua/foo` -> `trycua`).
    pub fn organization(&self) -> &str {
        self.repository.split('/').next().unwrap_or(&self.repository)
    }

    pub fn as_image_string(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// `http` for loopback/`localhost` registries (the convention plain
    /// local/dev registries rely on instead of a self-signed cert), `https`
    /// for everything else.
    pub fn scheme(&self) -> &'static str {
        let host = self.registry.split(':').next().unwrap_or(&self.registry);
        if host == "localhost" || host == "127.0.0.1" || host == "::1" {
            "http"
        } else {
            "https"
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Splits a leading registry host off a repository name, the way `docker.io/library/ubuntu`
/// is distinguished from `library/ubuntu`: a host segment must contain a `.` or `:` (port),
/// or be exactly `localhost`.
fn split_registry(name: &str) -> (String, &str) {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return (first.to_string(), rest);
        }
    }
    (DEFAULT_REGISTRY.to_string(), name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_and_tag() {
        let r = ImageReference::parse("trycua/macos-sequoia-vanilla:latest").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "trycua/macos-sequoia-vanilla");
        assert_eq!(r.tag, "latest");
        assert_eq!(r.organization(), "trycua");
    }

    #[test]
    fn parses_explicit_registry() {
        let r = ImageReference::parse("ghcr.io/trycua/foo:v2").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "trycua/foo");
        assert_eq!(r.tag, "v2");
    }

    #[test]
    fn rejects_empty() {
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn rejects_missing_tag() {
        assert!(ImageReference::parse("trycua/foo").is_err());
    }
}

//! Container image references: parsing, the `registry://` shorthand and the
//! rewrite to the in-network registry address.

use std::fmt;

/// Portable prefix meaning "the registry declared in the intent".
pub const REGISTRY_SCHEME: &str = "registry://";
/// Address of the registry service on the shared compose network.
pub const INTERNAL_REGISTRY_HOST: &str = "registry:5000";
pub const DOCKER_HUB_HOST: &str = "registry-1.docker.io";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    /// Registry host (with optional port); `None` means Docker Hub.
    pub host: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl ImageRef {
    pub fn parse(reference: &str) -> Self {
        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => (name, Some(digest.to_string())),
            None => (reference, None),
        };

        let (host, path) = match name.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (Some(first.to_string()), rest),
            _ => (None, name),
        };

        // A ':' after the last '/' separates the tag; earlier ones belong to the host.
        let last_slash = path.rfind('/').map(|idx| idx + 1).unwrap_or(0);
        let (repository, tag) = match path[last_slash..].rfind(':') {
            Some(idx) => {
                let split = last_slash + idx;
                (
                    path[..split].to_string(),
                    Some(path[split + 1..].to_string()),
                )
            }
            None => (path.to_string(), None),
        };

        Self {
            host,
            repository,
            tag: tag.filter(|tag| !tag.is_empty()),
            digest,
        }
    }

    /// Host used for registry API calls.
    pub fn registry_host(&self) -> &str {
        self.host.as_deref().unwrap_or(DOCKER_HUB_HOST)
    }

    /// Repository path as the registry API expects it.
    pub fn api_repository(&self) -> String {
        if self.host.is_none() && !self.repository.contains('/') {
            format!("library/{}", self.repository)
        } else {
            self.repository.clone()
        }
    }

    /// The same image pinned to `digest`, without a tag.
    pub fn with_digest(&self, digest: &str) -> String {
        match &self.host {
            Some(host) => format!("{host}/{}@{digest}", self.repository),
            None => format!("{}@{digest}", self.repository),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(host) = &self.host {
            write!(f, "{host}/")?;
        }
        f.write_str(&self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

fn looks_like_host(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

/// Expands `registry://` to the registry domain, then points references at the
/// registry domain to the in-network registry so pulls stay on the host.
pub fn normalize(reference: &str, registry_domain: &str) -> String {
    let expanded = match reference.strip_prefix(REGISTRY_SCHEME) {
        Some(rest) => format!("{registry_domain}/{rest}"),
        None => reference.to_string(),
    };

    let mut parsed = ImageRef::parse(&expanded);
    match parsed.host.as_deref() {
        Some(host) if host.eq_ignore_ascii_case(registry_domain) => {
            parsed.host = Some(INTERNAL_REGISTRY_HOST.to_string());
            parsed.to_string()
        }
        _ => expanded,
    }
}

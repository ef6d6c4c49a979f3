//! Container registry lookups.
//!
//! This module resolves a `repository:tag` pair to the digest the registry
//! currently serves for it:
//! - [`DigestResolver`]: the seam the updater depends on
//! - [`DockerHubClient`]: Docker Hub via an anonymous pull token and a
//!   `HEAD` on the manifest

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use crate::patcher::is_valid_digest;
use crate::retry::{RetryPolicy, with_backoff};

/// Docker Hub token service
const DOCKER_AUTH_URL: &str = "https://auth.docker.io/token";

/// Docker Hub registry API base URL
const DOCKER_REGISTRY_URL: &str = "https://registry.hub.docker.com/v2";

/// Manifest media type whose digest matches what `docker pull` reports
const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

const DIGEST_HEADER: &str = "Docker-Content-Digest";

const USER_AGENT: &str = "imagebump";

/// Errors resolving a digest.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry refused the token (401)
    #[error("registry refused authorization for {0}")]
    Unauthorized(String),

    /// No such repository or tag (404)
    #[error("tag {repository}:{tag} not found")]
    TagNotFound { repository: String, tag: String },

    /// The manifest response carried no digest header
    #[error("registry returned no {DIGEST_HEADER} header for {0}")]
    MissingDigest(String),

    /// The digest header did not look like `sha256:<hex>`
    #[error("registry returned malformed digest {0:?}")]
    InvalidDigest(String),

    /// Any other HTTP status
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Connection failure or timeout
    #[error("transport error: {0}")]
    Transport(String),

    /// Failed to parse the token response
    #[error("failed to parse registry response: {0}")]
    Parse(String),
}

impl RegistryError {
    /// Timeouts, connection errors, 429 and 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            RegistryError::Transport(_) => true,
            RegistryError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Looks up the digest currently published for an image tag.
pub trait DigestResolver {
    fn latest_digest(&self, repository: &str, tag: &str) -> Result<String, RegistryError>;
}

/// Response from the Docker Hub token endpoint.
///
/// Older deployments return `token`, newer ones `access_token`; both carry
/// the same value.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    fn into_token(self) -> Option<String> {
        self.access_token.or(self.token).filter(|t| !t.is_empty())
    }
}

/// Docker Hub client with bounded timeouts and retry.
pub struct DockerHubClient {
    agent: ureq::Agent,
    auth_url: String,
    registry_url: String,
    retry: RetryPolicy,
}

impl DockerHubClient {
    pub fn new(connect_timeout: Duration, timeout: Duration, retry: RetryPolicy) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            auth_url: DOCKER_AUTH_URL.to_string(),
            registry_url: DOCKER_REGISTRY_URL.to_string(),
            retry,
        }
    }

    /// Point the client at another token service and registry.
    pub fn with_endpoints(mut self, auth_url: &str, registry_url: &str) -> Self {
        self.auth_url = auth_url.trim_end_matches('/').to_string();
        self.registry_url = registry_url.trim_end_matches('/').to_string();
        self
    }

    fn manifest_url(&self, repository: &str, tag: &str) -> String {
        format!("{}/{}/manifests/{}", self.registry_url, repository, tag)
    }

    /// Anonymous pull token scoped to one repository.
    fn pull_token(&self, repository: &str) -> Result<String, RegistryError> {
        let scope = format!("repository:{}:pull", repository);
        let response = self
            .agent
            .get(&self.auth_url)
            .query("service", "registry.docker.io")
            .query("scope", &scope)
            .call();

        match response {
            Ok(resp) => {
                let body: TokenResponse = resp
                    .into_json()
                    .map_err(|e| RegistryError::Parse(e.to_string()))?;
                body.into_token()
                    .ok_or_else(|| RegistryError::Parse("token response had no token".to_string()))
            }
            Err(e) => Err(map_ureq_error(e, repository, None)),
        }
    }

    fn head_manifest(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        let token = self.pull_token(repository)?;
        let response = self
            .agent
            .head(&self.manifest_url(repository, tag))
            .set("Authorization", &format!("Bearer {}", token))
            .set("Accept", MANIFEST_V2)
            .call();

        match response {
            Ok(resp) => {
                let digest = resp
                    .header(DIGEST_HEADER)
                    .map(|d| d.trim().to_string())
                    .ok_or_else(|| {
                        RegistryError::MissingDigest(format!("{}:{}", repository, tag))
                    })?;
                if !is_valid_digest(&digest) {
                    return Err(RegistryError::InvalidDigest(digest));
                }
                Ok(digest)
            }
            Err(e) => Err(map_ureq_error(e, repository, Some(tag))),
        }
    }
}

impl DigestResolver for DockerHubClient {
    fn latest_digest(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        tracing::debug!("Fetching latest digest for {}:{}", repository, tag);
        let what = format!("registry lookup for {}:{}", repository, tag);
        let digest = with_backoff(&self.retry, &what, RegistryError::is_transient, || {
            self.head_manifest(repository, tag)
        })?;
        tracing::debug!("{}:{} is {}", repository, tag, digest);
        Ok(digest)
    }
}

fn map_ureq_error(error: ureq::Error, repository: &str, tag: Option<&str>) -> RegistryError {
    match error {
        ureq::Error::Status(401, _) => RegistryError::Unauthorized(repository.to_string()),
        ureq::Error::Status(404, resp) => match tag {
            Some(tag) => RegistryError::TagNotFound {
                repository: repository.to_string(),
                tag: tag.to_string(),
            },
            None => RegistryError::Http {
                status: 404,
                body: resp.into_string().unwrap_or_default(),
            },
        },
        ureq::Error::Status(status, resp) => RegistryError::Http {
            status,
            body: resp.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(t) => RegistryError::Transport(t.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RegistryError::Transport("timed out".into()).is_transient());
        assert!(
            RegistryError::Http {
                status: 503,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            RegistryError::Http {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !RegistryError::Http {
                status: 400,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !RegistryError::TagNotFound {
                repository: "a/b".into(),
                tag: "1".into()
            }
            .is_transient()
        );
        assert!(!RegistryError::Unauthorized("a/b".into()).is_transient());
    }

    #[test]
    fn test_token_response_prefers_access_token() {
        let both: TokenResponse =
            serde_json::from_str(r#"{"token": "old", "access_token": "new"}"#).unwrap();
        assert_eq!(both.into_token().as_deref(), Some("new"));

        let legacy: TokenResponse = serde_json::from_str(r#"{"token": "old"}"#).unwrap();
        assert_eq!(legacy.into_token().as_deref(), Some("old"));

        let empty: TokenResponse = serde_json::from_str(r#"{"expires_in": 300}"#).unwrap();
        assert!(empty.into_token().is_none());
    }

    #[test]
    fn test_manifest_url() {
        let client = DockerHubClient::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            RetryPolicy::immediate(1),
        );
        assert_eq!(
            client.manifest_url("myorg/ci", "latest"),
            "https://registry.hub.docker.com/v2/myorg/ci/manifests/latest"
        );

        let local = client.with_endpoints("http://127.0.0.1:1/token/", "http://127.0.0.1:1/v2/");
        assert_eq!(
            local.manifest_url("a/b", "1.0"),
            "http://127.0.0.1:1/v2/a/b/manifests/1.0"
        );
    }

    #[test]
    fn test_unreachable_registry_is_transport_error() {
        // Port 1 on loopback refuses connections immediately.
        let client = DockerHubClient::new(
            Duration::from_secs(1),
            Duration::from_secs(2),
            RetryPolicy::immediate(2),
        )
        .with_endpoints("http://127.0.0.1:1/token", "http://127.0.0.1:1/v2");

        let err = client.latest_digest("myorg/ci", "latest").unwrap_err();
        assert!(matches!(err, RegistryError::Transport(_)), "got {:?}", err);
    }
}

//! Anonymous/Bearer token negotiation (§4.1).

use base64::Engine;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{PullError, Result};
use crate::oci::reference::ImageReference;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Reads `<REG>_USERNAME` / `<REG>_TOKEN` for the registry's uppercased,
/// non-alphanumeric-stripped host name, e.g. `ghcr.io` -> `GHCR_IO_USERNAME`.
fn env_credentials(registry: &str) -> Option<(String, String)> {
    let prefix: String = registry
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    let username = std::env::var(format!("{prefix}_USERNAME")).ok()?;
    let token = std::env::var(format!("{prefix}_TOKEN")).ok()?;
    Some((username, token))
}

/// Fetches a (possibly anonymous) bearer token scoped to `repository:pull`.
pub async fn get_token(
    client: &reqwest::Client,
    reference: &ImageReference,
    also_push: bool,
) -> Result<String> {
    let mut scope = format!("repository:{}:pull", reference.repository);
    if also_push {
        scope.push_str(",push");
    }

    let url = format!(
        "{}://{}/token?service={}&scope={}",
        reference.scheme(),
        reference.registry,
        reference.registry,
        scope
    );

    let mut request = client.get(&url);
    if let Some((username, token)) = env_credentials(&reference.registry) {
        debug!(registry = %reference.registry, "using credentials from environment for token request");
        let basic = base64::engine::general_purpose::STANDARD.encode(format!("{username}:{token}"));
        request = request.header("Authorization", format!("Basic {basic}"));
    }

    let response = request.send().await.map_err(|e| PullError::TokenFetchFailed {
        repository: reference.repository.clone(),
        reason: e.to_string(),
    })?;

    if !response.status().is_success() {
        return Err(PullError::TokenFetchFailed {
            repository: reference.repository.clone(),
            reason: format!("registry returned {}", response.status()),
        });
    }

    let body: TokenResponse = response.json().await.map_err(|e| PullError::TokenFetchFailed {
        repository: reference.repository.clone(),
        reason: format!("invalid token response: {e}"),
    })?;

    match body.token.or(body.access_token) {
        Some(token) => Ok(token),
        None => {
            warn!(repository = %reference.repository, "token response had neither `token` nor `access_token`");
            Err(PullError::TokenFetchFailed {
                repository: reference.repository.clone(),
                reason: "response had neither `token` nor `access_token`".to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_credentials_prefix_sanitizes_host() {
        unsafe {
            std::env::set_var("GHCR_IO_USERNAME", "me");
            std::env::set_var("GHCR_IO_TOKEN", "secret");
        }
        let creds = env_credentials("ghcr.io");
        assert_eq!(creds, Some(("me".to_string(), "secret".to_string())));
        unsafe {
            std::env::remove_var("GHCR_IO_USERNAME");
            std::env::remove_var("GHCR_IO_TOKEN");
        }
    }
}

use super::SubscriptionError;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed this long before the server-reported expiry
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Token cache of the metadata server source
pub struct MetadataTokens {
    cached: Mutex<Option<CachedToken>>,
}

/// Source of OAuth bearer tokens for Pub/Sub requests
pub enum TokenSource {
    /// No authentication, used against the emulator
    Anonymous,
    /// A fixed token from configuration
    Static(String),
    /// Tokens fetched from the instance metadata server
    Metadata(MetadataTokens),
}

impl TokenSource {
    pub fn metadata() -> Self {
        TokenSource::Metadata(MetadataTokens {
            cached: Mutex::new(None),
        })
    }

    /// Current bearer token, or None when requests go unauthenticated
    pub async fn token(&self, http: &reqwest::Client) -> Result<Option<String>, SubscriptionError> {
        match self {
            TokenSource::Anonymous => Ok(None),
            TokenSource::Static(token) => Ok(Some(token.clone())),
            TokenSource::Metadata(tokens) => {
                let mut cached = tokens.cached.lock().await;
                if let Some(token) = cached.as_ref() {
                    if Instant::now() < token.refresh_at {
                        return Ok(Some(token.value.clone()));
                    }
                }

                let fetched = fetch_metadata_token(http).await?;
                let lifetime = Duration::from_secs(fetched.expires_in).saturating_sub(REFRESH_MARGIN);
                debug!(expires_in = fetched.expires_in, "Fetched access token from metadata server");

                let value = fetched.access_token;
                *cached = Some(CachedToken {
                    value: value.clone(),
                    refresh_at: Instant::now() + lifetime,
                });
                Ok(Some(value))
            }
        }
    }
}

async fn fetch_metadata_token(http: &reqwest::Client) -> Result<MetadataToken, SubscriptionError> {
    let response = http
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|e| SubscriptionError::Auth(e.to_string()))?;

    if !response.status().is_success() {
        return Err(SubscriptionError::Auth(format!(
            "metadata server returned {}",
            response.status()
        )));
    }

    response
        .json::<MetadataToken>()
        .await
        .map_err(|e| SubscriptionError::Auth(e.to_string()))
}

use reqwest::Client;

use super::error::FetchError;
use crate::retry::{self, BackoffConfig, RetryAction};

/// Where asset bytes come from.
#[async_trait::async_trait]
pub trait AssetSource: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError>;
}

/// Plain HTTP GET of pre-signed asset URLs.
#[derive(Debug, Clone)]
pub struct HttpAssetSource {
    client: Client,
}

impl HttpAssetSource {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl AssetSource for HttpAssetSource {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, FetchError> {
        let http_err = |source| FetchError::Http {
            location: location.to_string(),
            source,
        };
        let response = self.client.get(location).send().await.map_err(http_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                location: location.to_string(),
            });
        }

        let bytes = response.bytes().await.map_err(http_err)?;
        Ok(bytes.to_vec())
    }
}

/// Fetch one asset, retrying every transport failure with doubling delays
/// until the backoff ceiling is reached.
pub async fn fetch_with_backoff(
    source: &dyn AssetSource,
    location: &str,
    backoff: &BackoffConfig,
) -> Result<Vec<u8>, FetchError> {
    retry::retry_with_backoff(
        backoff,
        |_: &FetchError| RetryAction::Retry,
        || source.fetch(location),
    )
    .await
}

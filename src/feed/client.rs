use reqwest::header::CONTENT_TYPE;
use reqwest::Client;

use super::error::FeedError;
use super::record::{parse_page, Record};
use super::RecordSource;

/// HTTP client for the labs task history, authenticated with a session
/// bearer token.
#[derive(Clone)]
pub struct LabsClient {
    client: Client,
    base_url: String,
    auth_token: String,
}

impl std::fmt::Debug for LabsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LabsClient")
            .field("base_url", &self.base_url)
            .field("auth_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

impl LabsClient {
    pub fn new(base_url: &str, auth_token: &str) -> Result<Self, FeedError> {
        let client = Client::builder()
            .user_agent(concat!("dallepd-rs/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
        })
    }

    /// The underlying HTTP client, shared with the asset fetcher so both use
    /// one connection pool. Asset URLs are pre-signed and need no token.
    pub fn http_client(&self) -> Client {
        self.client.clone()
    }

    fn tasks_url(&self, page: u32, limit: u32) -> String {
        format!(
            "{}/api/labs/tasks?page={}&limit={}",
            self.base_url, page, limit
        )
    }
}

#[async_trait::async_trait]
impl RecordSource for LabsClient {
    async fn page(&self, page: u32, limit: u32) -> Result<Vec<Record>, FeedError> {
        let url = self.tasks_url(page, limit);
        let response = self
            .client
            .get(&url)
            .header(CONTENT_TYPE, "application/json")
            .bearer_auth(&self.auth_token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::HttpStatus {
                status: status.as_u16(),
                page,
            });
        }

        let body = response.text().await?;
        parse_page(&body)
    }
}

//! Readwise Reader v3 API client.
//!
//! The Reader API allows 20 requests per minute, so every call goes through
//! a pacing gate and a retry loop with exponential backoff. `Retry-After` is
//! honored on 429 responses.

use std::time::Duration;

use async_trait::async_trait;
#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;
use reqwest::{header, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

const BASE_URL: &str = "https://readwise.io/api/v3";

/// Slightly over 3 s keeps us under the 20 requests/minute budget.
const MIN_REQUEST_INTERVAL: Duration = Duration::from_millis(3100);
const MAX_RETRIES: u32 = 5;
const BASE_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum ReadwiseError {
    #[error("failed to construct HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Readwise API returned {status} for {url}: {body}")]
    Api {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("retries exhausted for {url}")]
    RetriesExhausted { url: String },
}

/// A document as returned by the Reader `/list/` endpoint. Only the fields
/// the sync pipeline needs are modelled.
#[derive(Debug, Clone, Deserialize)]
pub struct Document {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub html_content: Option<String>,
    #[serde(default, deserialize_with = "tags_as_list")]
    pub tags: Vec<String>,
}

impl Document {
    pub fn title(&self) -> &str {
        self.title.as_deref().filter(|t| !t.is_empty()).unwrap_or("Untitled")
    }

    /// Author for display purposes. The API uses "Unknown" as a filler value.
    pub fn author(&self) -> Option<&str> {
        self.author
            .as_deref()
            .filter(|a| !a.is_empty() && *a != "Unknown")
    }
}

/// Reader returns tags either as an object keyed by tag name or as a plain
/// array of names, depending on the document's age.
fn tags_as_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::Object(map) => map.keys().cloned().collect(),
        serde_json::Value::Array(items) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_owned))
            .collect(),
        _ => Vec::new(),
    })
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<Document>,
    #[serde(rename = "nextPageCursor")]
    next_page_cursor: Option<String>,
}

/// Selects the documents eligible for export: they must carry the configured
/// tag and sit in one of the configured locations.
pub fn filter_documents(
    documents: Vec<Document>,
    tag: &str,
    locations: &[String],
) -> Vec<Document> {
    documents
        .into_iter()
        .filter(|doc| doc.tags.iter().any(|t| t == tag))
        .filter(|doc| {
            doc.location
                .as_deref()
                .map_or(false, |loc| locations.iter().any(|l| l == loc))
        })
        .collect()
}

/// Abstraction over the Reader API so the orchestrator can be exercised with
/// mocks in tests.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ReaderApi: Send + Sync {
    /// Fetch all documents in a location, following pagination.
    async fn list_documents(&self, location: &str) -> Result<Vec<Document>, ReadwiseError>;

    /// Move a document to another location (e.g. archive after export).
    async fn update_location(&self, id: &str, location: &str) -> Result<(), ReadwiseError>;
}

/// Spaces out requests so consecutive calls respect a minimum interval.
pub(crate) struct RequestPacer {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub(crate) async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

/// Parses a `Retry-After` header expressed in seconds.
pub(crate) fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct ReadwiseClient {
    http: reqwest::Client,
    base_url: String,
    pacer: RequestPacer,
}

impl ReadwiseClient {
    pub fn new(access_token: &str) -> Result<Self, ReadwiseError> {
        let mut headers = header::HeaderMap::new();
        let auth = header::HeaderValue::from_str(&format!("Token {access_token}"))
            .map_err(|_| ReadwiseError::Api {
                url: BASE_URL.to_string(),
                status: StatusCode::UNAUTHORIZED,
                body: "access token contains invalid header characters".to_string(),
            })?;
        headers.insert(header::AUTHORIZATION, auth);

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ReadwiseError::Client)?;

        Ok(Self {
            http,
            base_url: BASE_URL.to_string(),
            pacer: RequestPacer::new(MIN_REQUEST_INTERVAL),
        })
    }

    /// Sends a request built by `make`, retrying on 429, 5xx and transport
    /// errors with exponential backoff.
    async fn send_with_retry<F>(&self, url: &str, make: F) -> Result<Response, ReadwiseError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay = BASE_RETRY_DELAY;

        for attempt in 1..=MAX_RETRIES {
            self.pacer.wait().await;

            match make().send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let wait = retry_after(&response).unwrap_or(delay);
                        warn!(
                            url,
                            attempt,
                            wait_secs = wait.as_secs(),
                            "Readwise API rate limited, backing off"
                        );
                        sleep(wait).await;
                    } else if status.is_server_error() {
                        warn!(url, %status, attempt, "Readwise API server error, retrying");
                        sleep(delay).await;
                    } else if !status.is_success() {
                        let body = response.text().await.unwrap_or_default();
                        return Err(ReadwiseError::Api {
                            url: url.to_string(),
                            status,
                            body,
                        });
                    } else {
                        return Ok(response);
                    }
                }
                Err(source) => {
                    if attempt == MAX_RETRIES {
                        return Err(ReadwiseError::Http {
                            url: url.to_string(),
                            source,
                        });
                    }
                    warn!(url, attempt, error = %source, "Readwise API request failed, retrying");
                    sleep(delay).await;
                }
            }

            delay *= 2;
        }

        Err(ReadwiseError::RetriesExhausted {
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl ReaderApi for ReadwiseClient {
    async fn list_documents(&self, location: &str) -> Result<Vec<Document>, ReadwiseError> {
        let url = format!("{}/list/", self.base_url);
        let mut documents = Vec::new();
        let mut cursor: Option<String> = None;

        debug!(location, "Fetching documents from location");
        loop {
            let mut params: Vec<(&str, String)> = vec![
                ("location", location.to_string()),
                ("withHtmlContent", "true".to_string()),
            ];
            if let Some(c) = &cursor {
                params.push(("pageCursor", c.clone()));
            }

            let response = self
                .send_with_retry(&url, || self.http.get(&url).query(&params))
                .await?;
            let page: ListResponse = response.json().await.map_err(|source| {
                ReadwiseError::Http {
                    url: url.clone(),
                    source,
                }
            })?;

            documents.extend(page.results);
            cursor = page.next_page_cursor;
            if cursor.is_none() {
                break;
            }
        }

        info!(location, count = documents.len(), "Fetched documents from location");
        Ok(documents)
    }

    async fn update_location(&self, id: &str, location: &str) -> Result<(), ReadwiseError> {
        let url = format!("{}/update/{}/", self.base_url, id);
        let body = serde_json::json!({ "location": location });

        self.send_with_retry(&url, || self.http.patch(&url).json(&body))
            .await?;
        info!(id, location, "Updated document location");
        Ok(())
    }
}

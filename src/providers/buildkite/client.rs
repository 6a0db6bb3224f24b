use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::LINK;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::auth::Token;
use crate::config::{BuildkiteConfig, RetryPolicy};
use crate::error::{BkLensError, Result};

use super::types::{Build, BuildState, Step, StepState};

/// One page of the "list builds" endpoint, newest build first.
#[derive(Debug, Clone, Default)]
pub struct BuildsPage {
    pub builds: Vec<Build>,
    /// Cursor for the following page; `None` on the last page
    pub next_page: Option<u32>,
}

/// Anything that can serve pages of builds for one pipeline.
///
/// Implemented by [`BuildkiteClient`]; the fetcher only depends on this seam.
#[allow(async_fn_in_trait)]
pub trait BuildSource {
    /// Fetches one page. `None` requests the first (newest) page.
    async fn fetch_page(&self, page: Option<u32>) -> Result<BuildsPage>;
}

/// HTTP client for the Buildkite REST API, scoped to one pipeline.
pub struct BuildkiteClient {
    client: Client,
    builds_url: Url,
    token: Option<Token>,
    per_page: usize,
    retry: RetryPolicy,
}

impl BuildkiteClient {
    /// Creates a client for `organization`/`pipeline`.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the HTTP client cannot be built or the base URL is invalid.
    pub fn new(
        config: &BuildkiteConfig,
        organization: &str,
        pipeline: &str,
        token: Option<Token>,
    ) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("bklens/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| BkLensError::Config(format!("Failed to create HTTP client: {e}")))?;

        let mut builds_url = Url::parse(&config.base_url)
            .map_err(|e| BkLensError::Config(format!("Invalid base URL: {e}")))?;

        builds_url
            .path_segments_mut()
            .map_err(|()| BkLensError::Config("Base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(["organizations", organization, "pipelines", pipeline, "builds"]);

        Ok(Self {
            client,
            builds_url,
            token,
            per_page: config.per_page,
            retry: config.retry.clone(),
        })
    }

    pub fn builds_url(&self) -> &Url {
        &self.builds_url
    }

    fn auth_request(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            request.bearer_auth(token.as_str())
        } else {
            request
        }
    }

    /// Waits before retry `retry_count`, or returns `false` once retries are exhausted.
    async fn backoff(&self, retry_count: u32, reason: &str) -> bool {
        if retry_count >= self.retry.max_retries {
            return false;
        }
        let delay = self.retry.delay_for_retry(retry_count);
        warn!(
            "{reason}. Waiting {}ms before retry {}/{}...",
            delay.as_millis(),
            retry_count + 1,
            self.retry.max_retries
        );
        tokio::time::sleep(delay).await;
        true
    }

    /// GET and decode one page.
    ///
    /// Network errors, 429, 5xx and bodies that break off or fail to decode
    /// are retried with exponential backoff.
    async fn get_page_with_retry(&self, page: u32) -> Result<BuildsPage> {
        let mut retry_count = 0;
        loop {
            let request = self.auth_request(self.client.get(self.builds_url.clone()).query(&[
                ("page", page.to_string()),
                ("per_page", self.per_page.to_string()),
            ]));

            let response = match request.send().await {
                Ok(resp) => resp,
                Err(e) if e.is_connect() || e.is_timeout() || e.is_request() => {
                    if !self.backoff(retry_count, &format!("Network error ({e})")).await {
                        return Err(e.into());
                    }
                    retry_count += 1;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                let reason = format!("Buildkite API error (status {status})");
                if !self.backoff(retry_count, &reason).await {
                    return Err(BkLensError::ApiErrorAfterRetries {
                        status: status.as_u16(),
                        retries: self.retry.max_retries,
                    });
                }
                retry_count += 1;
                continue;
            }

            if !status.is_success() {
                let error_text = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "Unable to read error response".to_string());
                return Err(BkLensError::ApiError {
                    status: status.as_u16(),
                    message: error_text,
                });
            }

            let next_page = response
                .headers()
                .get(LINK)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_next_page);

            match response.json::<Vec<ApiBuild>>().await {
                Ok(builds) => {
                    return Ok(BuildsPage {
                        builds: builds.into_iter().map(Build::from).collect(),
                        next_page,
                    })
                }
                Err(e) if e.is_body() || e.is_decode() => {
                    let reason = format!("Reading builds page {page} failed ({e})");
                    if !self.backoff(retry_count, &reason).await {
                        return Err(e.into());
                    }
                    retry_count += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl BuildSource for BuildkiteClient {
    async fn fetch_page(&self, page: Option<u32>) -> Result<BuildsPage> {
        let page = page.unwrap_or(1);
        debug!("GET {} (page {page})", self.builds_url());
        self.get_page_with_retry(page).await
    }
}

/// Extracts the `page` parameter of the `rel="next"` entry of a `Link` header.
fn parse_next_page(link_header: &str) -> Option<u32> {
    link_header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts.next()?.trim();
        let is_next = parts.any(|param| param.trim() == "rel=\"next\"");
        if !is_next {
            return None;
        }

        let target = target.strip_prefix('<')?.strip_suffix('>')?;
        let url = Url::parse(target).ok()?;
        url.query_pairs()
            .find(|(name, _)| name == "page")
            .and_then(|(_, value)| value.parse().ok())
    })
}

#[derive(Debug, Deserialize)]
struct ApiBuild {
    number: u64,
    state: BuildState,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    jobs: Vec<ApiJob>,
    pipeline: Option<ApiPipeline>,
}

#[derive(Debug, Deserialize)]
struct ApiPipeline {
    slug: String,
}

#[derive(Debug, Deserialize)]
struct ApiJob {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    step_key: Option<String>,
    name: Option<String>,
    state: Option<StepState>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl From<ApiBuild> for Build {
    fn from(api: ApiBuild) -> Self {
        Self {
            number: api.number,
            state: api.state,
            pipeline_slug: api.pipeline.map(|p| p.slug),
            created_at: api.created_at,
            started_at: api.started_at,
            finished_at: api.finished_at,
            steps: api
                .jobs
                .into_iter()
                .map(|job| Step {
                    id: job.id,
                    kind: job.kind,
                    key: job.step_key,
                    name: job.name,
                    state: job.state,
                    started_at: job.started_at,
                    finished_at: job.finished_at,
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const PAGE_BODY: &str = r#"[
      {
        "id": "f62a1b4d", "number": 42, "state": "passed",
        "created_at": "2024-04-02T10:00:00.000Z",
        "started_at": "2024-04-02T10:00:05.000Z",
        "finished_at": "2024-04-02T10:20:05.000Z",
        "web_url": "https://buildkite.com/acme/web/builds/42",
        "pipeline": { "slug": "web", "name": "Web" },
        "jobs": [
          { "id": "j1", "type": "script", "step_key": "lint", "name": ":eslint:",
            "state": "passed", "started_at": "2024-04-02T10:01:00.000Z",
            "finished_at": "2024-04-02T10:03:00.000Z", "exit_status": 0 },
          { "id": "j2", "type": "waiter" },
          { "id": "j3", "type": "script", "step_key": null, "name": ":pipeline:",
            "state": "timed_out" }
        ]
      },
      {
        "number": 41, "state": "running",
        "created_at": "2024-04-02T09:00:00Z",
        "started_at": "2024-04-02T09:00:02Z",
        "finished_at": null
      }
    ]"#;

    fn test_config(base_url: &str) -> BuildkiteConfig {
        BuildkiteConfig {
            base_url: format!("{base_url}/v2"),
            per_page: 2,
            retry: RetryPolicy {
                max_retries: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                multiplier: 2,
            },
            ..BuildkiteConfig::default()
        }
    }

    #[test]
    fn test_builds_url() {
        let client =
            BuildkiteClient::new(&BuildkiteConfig::default(), "acme", "web-app", None).unwrap();
        assert_eq!(
            client.builds_url().as_str(),
            "https://api.buildkite.com/v2/organizations/acme/pipelines/web-app/builds"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        let config = BuildkiteConfig {
            base_url: "not a url".to_string(),
            ..BuildkiteConfig::default()
        };
        let result = BuildkiteClient::new(&config, "acme", "web", None);
        assert!(matches!(result, Err(BkLensError::Config(_))));
    }

    #[test]
    fn test_parse_next_page() {
        let header = "<https://api.buildkite.com/v2/organizations/acme/pipelines/web/builds?page=3&per_page=100>; rel=\"next\", \
                      <https://api.buildkite.com/v2/organizations/acme/pipelines/web/builds?page=9&per_page=100>; rel=\"last\"";
        assert_eq!(parse_next_page(header), Some(3));

        let last_page = "<https://api.buildkite.com/v2/x?page=1>; rel=\"first\", <https://api.buildkite.com/v2/x?page=8>; rel=\"prev\"";
        assert_eq!(parse_next_page(last_page), None);
        assert_eq!(parse_next_page(""), None);
    }

    #[tokio::test]
    async fn test_fetch_page_parses_builds_and_cursor() {
        let mut server = mockito::Server::new_async().await;
        let next = format!(
            "<{}/v2/organizations/acme/pipelines/web/builds?page=2&per_page=2>; rel=\"next\"",
            server.url()
        );
        let mock = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("page".into(), "1".into()),
                Matcher::UrlEncoded("per_page".into(), "2".into()),
            ]))
            .match_header("authorization", "Bearer bkua-secret")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_header("link", &next)
            .with_body(PAGE_BODY)
            .create_async()
            .await;

        let client = BuildkiteClient::new(
            &test_config(&server.url()),
            "acme",
            "web",
            Some(Token::from("bkua-secret")),
        )
        .unwrap();

        let page = client.fetch_page(None).await.unwrap();
        mock.assert_async().await;

        assert_eq!(page.next_page, Some(2));
        assert_eq!(page.builds.len(), 2);

        let finished = &page.builds[0];
        assert_eq!(finished.number, 42);
        assert_eq!(finished.state, BuildState::Passed);
        assert_eq!(finished.pipeline_slug.as_deref(), Some("web"));
        assert_eq!(finished.duration_seconds(), Some(1200.0));
        assert_eq!(finished.steps.len(), 3);
        assert_eq!(finished.steps[0].key.as_deref(), Some("lint"));
        assert_eq!(finished.steps[1].kind, "waiter");
        assert_eq!(finished.steps[1].key, None);
        assert_eq!(finished.steps[2].state, Some(BuildState::Unknown));

        let running = &page.builds[1];
        assert!(!running.is_finished());
        assert!(running.steps.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_page_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let failing = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(502)
            .expect(3)
            .create_async()
            .await;

        let client =
            BuildkiteClient::new(&test_config(&server.url()), "acme", "web", None).unwrap();

        let err = client.fetch_page(Some(4)).await.unwrap_err();
        failing.assert_async().await;
        assert!(matches!(
            err,
            BkLensError::ApiErrorAfterRetries {
                status: 502,
                retries: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_page_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(401)
            .with_body(r#"{"message":"Authentication required"}"#)
            .expect(1)
            .create_async()
            .await;

        let client =
            BuildkiteClient::new(&test_config(&server.url()), "acme", "web", None).unwrap();

        let err = client.fetch_page(None).await.unwrap_err();
        mock.assert_async().await;
        match err {
            BkLensError::ApiError { status, message } => {
                assert_eq!(status, 401);
                assert!(message.contains("Authentication required"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_page_retries_rate_limit_then_succeeds() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "1")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(PAGE_BODY)
            .expect(1)
            .create_async()
            .await;

        let client =
            BuildkiteClient::new(&test_config(&server.url()), "acme", "web", None).unwrap();

        let page = client.fetch_page(None).await.unwrap();
        limited.assert_async().await;
        ok.assert_async().await;

        assert_eq!(page.builds.len(), 2);
        assert_eq!(page.builds[0].number, 42);
        assert_eq!(page.next_page, None);
    }

    #[tokio::test]
    async fn test_fetch_page_rate_limit_exhausts_retries() {
        let mut server = mockito::Server::new_async().await;
        let limited = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(429)
            .expect(3)
            .create_async()
            .await;

        let client =
            BuildkiteClient::new(&test_config(&server.url()), "acme", "web", None).unwrap();

        let err = client.fetch_page(None).await.unwrap_err();
        limited.assert_async().await;
        assert!(matches!(
            err,
            BkLensError::ApiErrorAfterRetries {
                status: 429,
                retries: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_fetch_page_retries_truncated_body() {
        let mut server = mockito::Server::new_async().await;
        let truncated = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"[{"number": 42, "state": "pas"#)
            .expect(1)
            .create_async()
            .await;
        let complete = server
            .mock("GET", "/v2/organizations/acme/pipelines/web/builds")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(PAGE_BODY)
            .expect(1)
            .create_async()
            .await;

        let client =
            BuildkiteClient::new(&test_config(&server.url()), "acme", "web", None).unwrap();

        let page = client.fetch_page(Some(2)).await.unwrap();
        truncated.assert_async().await;
        complete.assert_async().await;
        assert_eq!(page.builds.len(), 2);
    }
}

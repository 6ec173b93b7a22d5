//! Record sources: the remote JSON collection over HTTP, plus local fixture files.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use docsync_core::{json_type_name, Record};
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "docsync-adapters";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding records: {0}")]
    Decode(String),
}

impl FetchError {
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Decode(_))
    }
}

/// Single-shot HTTP GET client. No retries: a failed fetch fails the run.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let transport = |source| FetchError::Transport {
            url: url.to_string(),
            source,
        };

        let resp = self.client.get(url).send().await.map_err(transport)?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await.map_err(transport)?.to_vec();
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

/// Decode a body that must be a JSON array of objects. Order is preserved.
pub fn decode_records(body: &[u8]) -> Result<Vec<Record>, FetchError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| FetchError::Decode(format!("invalid JSON: {err}")))?;
    let Value::Array(items) = value else {
        return Err(FetchError::Decode(format!(
            "expected a JSON array, found {}",
            json_type_name(&value)
        )));
    };

    items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            Record::try_from(item)
                .map_err(|err| FetchError::Decode(format!("element {index}: {err}")))
        })
        .collect()
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn describe(&self) -> String;

    async fn fetch(&self) -> Result<Vec<Record>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpJsonSource {
    fetcher: HttpFetcher,
    url: String,
}

impl HttpJsonSource {
    pub fn new(fetcher: HttpFetcher, url: impl Into<String>) -> Self {
        Self {
            fetcher,
            url: url.into(),
        }
    }
}

#[async_trait]
impl RecordSource for HttpJsonSource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let span = info_span!("http_fetch", url = %self.url);
        async {
            let response = self.fetcher.fetch_bytes(&self.url).await?;
            match response.content_type.as_deref() {
                Some(ct) if is_json_content_type(ct) => {}
                other => warn!(
                    content_type = other.unwrap_or("<missing>"),
                    url = %response.final_url,
                    "response is not labelled as JSON; decoding anyway"
                ),
            }
            decode_records(&response.body)
        }
        .instrument(span)
        .await
    }
}

fn is_json_content_type(value: &str) -> bool {
    let essence = value.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json") || essence.to_ascii_lowercase().ends_with("+json")
}

/// JSON array read from disk, for offline runs and fixtures.
#[derive(Debug, Clone)]
pub struct FileJsonSource {
    path: PathBuf,
}

impl FileJsonSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RecordSource for FileJsonSource {
    fn describe(&self) -> String {
        format!("file://{}", self.path.display())
    }

    async fn fetch(&self) -> Result<Vec<Record>, FetchError> {
        let body = fs::read(&self.path).await.map_err(|source| FetchError::Io {
            path: self.path.clone(),
            source,
        })?;
        decode_records(&body)
    }
}

/// Pick a source for `location`: `http(s)://` URLs go over the network, `file://` URLs are read locally.
pub fn source_for_location(
    location: &str,
    http: HttpClientConfig,
) -> anyhow::Result<Box<dyn RecordSource>> {
    let url = Url::parse(location).with_context(|| format!("parsing source url {location:?}"))?;
    match url.scheme() {
        "http" | "https" => {
            let fetcher = HttpFetcher::new(http)?;
            Ok(Box::new(HttpJsonSource::new(fetcher, location)))
        }
        "file" => {
            let Ok(path) = url.to_file_path() else {
                bail!("source url {location:?} is not a local file path");
            };
            Ok(Box::new(FileJsonSource::new(path)))
        }
        other => bail!("unsupported source scheme {other:?} in {location:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn fixture_path(name: &str) -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures")
            .join(name)
    }

    #[test]
    fn decodes_array_of_objects_in_order() {
        let records = decode_records(br#"[{"id":1,"title":"a"},{"id":2,"title":"b"}]"#)
            .expect("decode");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].get("id"), Some(&Value::from(1)));
        assert_eq!(records[1].get("title"), Some(&Value::from("b")));
    }

    #[test]
    fn empty_array_decodes_to_no_records() {
        assert!(decode_records(b"[]").expect("decode").is_empty());
    }

    #[test]
    fn non_json_body_is_a_decode_error() {
        let err = decode_records(b"<html>oops</html>").expect_err("not json");
        assert!(err.is_decode());
    }

    #[test]
    fn non_array_body_is_a_decode_error() {
        let err = decode_records(br#"{"id":1}"#).expect_err("object body");
        assert!(err.is_decode());
        assert!(err.to_string().contains("found object"));
    }

    #[test]
    fn non_object_element_is_a_decode_error() {
        let err = decode_records(br#"[{"id":1}, 7]"#).expect_err("number element");
        assert!(err.is_decode());
        assert!(err.to_string().contains("element 1"));
    }

    #[test]
    fn json_content_types_are_recognised() {
        assert!(is_json_content_type("application/json"));
        assert!(is_json_content_type("application/json; charset=utf-8"));
        assert!(is_json_content_type("application/vnd.api+json"));
        assert!(!is_json_content_type("text/html"));
    }

    #[tokio::test]
    async fn file_source_reads_fixture_collection() {
        let source = FileJsonSource::new(fixture_path("posts/sample.json"));
        let records = source.fetch().await.expect("fetch fixture");
        assert_eq!(records.len(), 4);
        assert!(records.iter().all(|r| r.get("userId").is_some()));
    }

    #[tokio::test]
    async fn file_source_surfaces_decode_errors() {
        let source = FileJsonSource::new(fixture_path("malformed/not_an_array.json"));
        let err = source.fetch().await.expect_err("malformed fixture");
        assert!(err.is_decode());
    }

    #[tokio::test]
    async fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let source = FileJsonSource::new(dir.path().join("absent.json"));
        let err = source.fetch().await.expect_err("missing");
        assert!(matches!(err, FetchError::Io { .. }));
    }

    #[test]
    fn location_scheme_selects_source() {
        let http = source_for_location("https://example.com/posts", HttpClientConfig::default())
            .expect("http source");
        assert_eq!(http.describe(), "https://example.com/posts");

        let file = source_for_location("file:///tmp/posts.json", HttpClientConfig::default())
            .expect("file source");
        assert_eq!(file.describe(), "file:///tmp/posts.json");

        assert!(source_for_location("ftp://example.com/x", HttpClientConfig::default()).is_err());
        assert!(source_for_location("not a url", HttpClientConfig::default()).is_err());
    }
}

//! HuggingFace model downloader
//!
//! Resolves model names to local GGUF files, downloading them from the
//! Hugging Face Hub when needed. Every hub request goes through a retry
//! policy and carries the access token when one is configured.

use reqwest::header::USER_AGENT;
use reqwest::{Method, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

const CLIENT_USER_AGENT: &str = concat!("localqa/", env!("CARGO_PKG_VERSION"));

/// Errors raised while talking to the hub or writing model files
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Invalid model name: {0}")]
    InvalidModelName(String),

    #[error("Local model file not found: {}", .0.display())]
    LocalFileMissing(PathBuf),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Hub returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("No GGUF files found in {0}")]
    NoGgufFiles(String),

    #[error("Multiple GGUF files found in {repo}, specify one of: {}", .files.join(", "))]
    AmbiguousGguf { repo: String, files: Vec<String> },

    #[error("Download incomplete: got {got} bytes, expected {expected}")]
    Incomplete { got: u64, expected: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Retry behaviour for hub requests
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay, doubled after every retry
    pub backoff_factor: Duration,
    /// Status codes considered transient
    pub retry_statuses: Vec<StatusCode>,
    /// Methods safe to repeat
    pub retry_methods: Vec<Method>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_factor: Duration::from_secs(1),
            retry_statuses: vec![
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::INTERNAL_SERVER_ERROR,
                StatusCode::BAD_GATEWAY,
                StatusCode::SERVICE_UNAVAILABLE,
                StatusCode::GATEWAY_TIMEOUT,
            ],
            retry_methods: vec![Method::HEAD, Method::GET, Method::OPTIONS],
        }
    }
}

impl RetryPolicy {
    pub fn allows_method(&self, method: &Method) -> bool {
        self.retry_methods.contains(method)
    }

    pub fn retries_status(&self, status: StatusCode) -> bool {
        self.retry_statuses.contains(&status)
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_factor * 2u32.saturating_pow(retry.saturating_sub(1))
    }
}

/// Parsed model reference on the hub
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HuggingFaceUrl {
    pub repo_id: String,
    pub filename: String,
    pub revision: String,
}

impl HuggingFaceUrl {
    /// Parse a hub reference
    ///
    /// Accepted forms:
    /// 1. `https://huggingface.co/owner/repo/blob/main/model.gguf`
    /// 2. `https://huggingface.co/owner/repo/resolve/main/model.gguf`
    /// 3. `owner/repo/model.gguf`
    /// 4. `owner/repo`
    pub fn parse(url: &str) -> Result<Self, HubError> {
        let url = url.trim();
        let url = url.split('?').next().unwrap_or(url);
        let url = url.split('#').next().unwrap_or(url);

        let path = url
            .strip_prefix("https://huggingface.co/")
            .or_else(|| url.strip_prefix("http://huggingface.co/"))
            .unwrap_or(url);

        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(HubError::InvalidModelName(url.to_string()));
        }
        let repo_id = format!("{}/{}", parts[0], parts[1]);

        if let Some(pos) = parts.iter().position(|&p| p == "blob" || p == "resolve") {
            if parts.len() > pos + 2 {
                return Ok(Self {
                    repo_id,
                    filename: parts[pos + 2..].join("/"),
                    revision: parts[pos + 1].to_string(),
                });
            }
            return Err(HubError::InvalidModelName(url.to_string()));
        }

        Ok(Self {
            repo_id,
            filename: parts[2..].join("/"),
            revision: "main".to_string(),
        })
    }
}

/// Turn a repository path into a safe local file name
fn sanitize_local_filename(filename: &str) -> Result<String, HubError> {
    let flattened = filename
        .trim()
        .trim_start_matches('/')
        .replace('\\', "/")
        .replace('/', "__");

    let mut sanitized: String = flattened
        .chars()
        .map(|ch| {
            if matches!(ch, '<' | '>' | ':' | '"' | '|' | '?' | '*') || ch.is_control() {
                '_'
            } else {
                ch
            }
        })
        .collect();

    while sanitized.ends_with('.') || sanitized.ends_with(' ') {
        sanitized.pop();
    }

    if sanitized.is_empty() {
        return Err(HubError::InvalidModelName(filename.to_string()));
    }
    Ok(sanitized)
}

/// Pick the file to download when a repository holds several GGUF files
fn choose_gguf(repo: &str, files: Vec<String>) -> Result<String, HubError> {
    match files.len() {
        0 => Err(HubError::NoGgufFiles(repo.to_string())),
        1 => Ok(files.into_iter().next().unwrap_or_default()),
        _ => {
            if let Some(preferred) = files
                .iter()
                .find(|f| f.to_ascii_uppercase().contains("Q4_K_M"))
            {
                return Ok(preferred.clone());
            }
            Err(HubError::AmbiguousGguf {
                repo: repo.to_string(),
                files,
            })
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct FileInfo {
    path: String,
}

#[derive(Debug, serde::Deserialize)]
struct WhoAmI {
    name: String,
}

/// Hub client with retries and optional token authentication
#[derive(Debug, Clone)]
pub struct HubClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    retry: RetryPolicy,
}

impl HubClient {
    pub fn new(
        endpoint: impl Into<String>,
        token: Option<String>,
        retry: RetryPolicy,
    ) -> Result<Self, HubError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            token,
            retry,
        })
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Check the configured token against the hub, returning the account name
    pub async fn login(&self) -> Result<Option<String>, HubError> {
        if self.token.is_none() {
            return Ok(None);
        }

        let url = format!("{}/api/whoami-v2", self.endpoint);
        let response = self.send(Method::GET, &url).await?;
        let whoami: WhoAmI = response.json().await?;
        Ok(Some(whoami.name))
    }

    /// Resolve a model name to a local GGUF file, downloading it if necessary
    pub async fn resolve(&self, model_name: &str, models_dir: &Path) -> Result<PathBuf, HubError> {
        let local = Path::new(model_name);
        if local.is_file() {
            tracing::debug!("Using local model file {}", local.display());
            return Ok(local.to_path_buf());
        }
        if model_name.starts_with('.') || model_name.starts_with('/') || model_name.contains('\\') {
            return Err(HubError::LocalFileMissing(local.to_path_buf()));
        }

        let hf_url = HuggingFaceUrl::parse(model_name)?;
        self.download(&hf_url, models_dir, |downloaded, total| {
            tracing::debug!("Downloaded {} / {} bytes", downloaded, total);
        })
        .await
    }

    /// Download a model file into `models_dir`
    pub async fn download(
        &self,
        hf_url: &HuggingFaceUrl,
        models_dir: &Path,
        progress_callback: impl Fn(u64, u64),
    ) -> Result<PathBuf, HubError> {
        let filename = if hf_url.filename.is_empty() {
            let files = self.list_gguf_files(&hf_url.repo_id, &hf_url.revision).await?;
            choose_gguf(&hf_url.repo_id, files)?
        } else {
            hf_url.filename.clone()
        };

        let safe_filename = sanitize_local_filename(&filename)?;
        fs::create_dir_all(models_dir).await?;

        let output_path = models_dir.join(&safe_filename);
        let temp_path = models_dir.join(format!("{}.tmp", safe_filename));

        if let Ok(metadata) = fs::metadata(&output_path).await {
            if metadata.len() > 0 {
                tracing::info!("Model already downloaded: {}", output_path.display());
                return Ok(output_path);
            }
        }

        let download_url = format!(
            "{}/{}/resolve/{}/{}",
            self.endpoint, hf_url.repo_id, hf_url.revision, filename
        );
        tracing::info!("Downloading from: {}", download_url);

        let response = self.send(Method::GET, &download_url).await?;
        if let Err(e) = stream_to_file(response, &temp_path, &progress_callback).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e);
        }

        fs::rename(&temp_path, &output_path).await?;
        tracing::info!("Download complete: {}", output_path.display());

        Ok(output_path)
    }

    /// List GGUF files in a repository
    pub async fn list_gguf_files(&self, repo_id: &str, revision: &str) -> Result<Vec<String>, HubError> {
        let url = format!("{}/api/models/{}/tree/{}", self.endpoint, repo_id, revision);
        let files: Vec<FileInfo> = self.send(Method::GET, &url).await?.json().await?;

        Ok(files
            .into_iter()
            .filter(|f| f.path.ends_with(".gguf"))
            .map(|f| f.path)
            .collect())
    }

    /// Send a request, retrying transient failures for idempotent methods
    async fn send(&self, method: Method, url: &str) -> Result<Response, HubError> {
        let retryable = self.retry.allows_method(&method);
        let mut retry = 0;

        loop {
            let mut request = self
                .client
                .request(method.clone(), url)
                .header(USER_AGENT, CLIENT_USER_AGENT);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let can_retry = retryable && retry < self.retry.max_retries;
            match request.send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if can_retry && self.retry.retries_status(response.status()) => {
                    tracing::warn!("{} {} returned {}, retrying", method, url, response.status());
                }
                Ok(response) => {
                    return Err(HubError::Status {
                        status: response.status(),
                        url: url.to_string(),
                    })
                }
                Err(e) if can_retry && (e.is_connect() || e.is_timeout()) => {
                    tracing::warn!("{} {} failed: {}, retrying", method, url, e);
                }
                Err(e) => return Err(HubError::Http(e)),
            }

            retry += 1;
            tokio::time::sleep(self.retry.backoff(retry)).await;
        }
    }
}

/// Write a response body to `path`, checking it against the announced length
async fn stream_to_file(
    mut response: Response,
    path: &Path,
    progress_callback: &impl Fn(u64, u64),
) -> Result<u64, HubError> {
    let total_size = response.content_length().unwrap_or(0);
    tracing::info!("File size: {}", format_size(total_size));

    let mut file = File::create(path).await?;
    let mut downloaded: u64 = 0;
    let mut last_logged_pct = 0;
    while let Some(chunk) = response.chunk().await? {
        file.write_all(&chunk).await?;
        downloaded += chunk.len() as u64;
        progress_callback(downloaded, total_size);

        if total_size > 0 {
            let pct = downloaded * 100 / total_size;
            if pct >= last_logged_pct + 10 {
                last_logged_pct = pct;
                tracing::info!("Download progress: {}%", pct);
            }
        }
    }
    file.flush().await?;

    if total_size > 0 && downloaded != total_size {
        return Err(HubError::Incomplete {
            got: downloaded,
            expected: total_size,
        });
    }
    Ok(downloaded)
}

/// Get a human-readable size string
pub fn format_size(bytes: u64) -> String {
    let bytes = bytes as f64;
    if bytes < 1024.0 {
        format!("{} B", bytes as u64)
    } else if bytes < 1024.0 * 1024.0 {
        format!("{:.2} KB", bytes / 1024.0)
    } else if bytes < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2} MB", bytes / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes / (1024.0 * 1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Canned HTTP reply; `length` overrides the announced Content-Length
    struct Reply {
        status: u16,
        body: &'static str,
        length: Option<usize>,
    }

    fn reply(status: u16, body: &'static str) -> Reply {
        Reply {
            status,
            body,
            length: None,
        }
    }

    /// Serve `replies` in order, one per connection, recording each request head
    async fn serve(replies: Vec<Reply>) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let endpoint = format!("http://{}", listener.local_addr().unwrap());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            for reply in replies {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                seen.lock().unwrap().push(String::from_utf8_lossy(&head).into_owned());

                let response = format!(
                    "HTTP/1.1 {} Scripted\r\nContent-Length: {}\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n{}",
                    reply.status,
                    reply.length.unwrap_or(reply.body.len()),
                    reply.body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (endpoint, requests)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            backoff_factor: Duration::from_millis(5),
            ..RetryPolicy::default()
        }
    }

    fn request_count(requests: &Arc<Mutex<Vec<String>>>) -> usize {
        requests.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_send_gives_up_after_max_retries() {
        let (endpoint, requests) = serve((0..4).map(|_| reply(503, "")).collect()).await;
        let client = HubClient::new(&endpoint, None, fast_retry()).unwrap();

        let err = client
            .send(Method::GET, &format!("{}/api/x", endpoint))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HubError::Status { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE
        ));
        assert_eq!(request_count(&requests), 4);
    }

    #[tokio::test]
    async fn test_send_recovers_after_transient_status() {
        let (endpoint, requests) = serve(vec![reply(503, ""), reply(200, "{}")]).await;
        let client = HubClient::new(&endpoint, None, fast_retry()).unwrap();

        let response = client
            .send(Method::GET, &format!("{}/api/x", endpoint))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(request_count(&requests), 2);
    }

    #[tokio::test]
    async fn test_send_returns_client_errors_immediately() {
        let (endpoint, requests) = serve(vec![reply(404, ""), reply(200, "{}")]).await;
        let client = HubClient::new(&endpoint, None, fast_retry()).unwrap();

        let err = client
            .send(Method::GET, &format!("{}/api/x", endpoint))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HubError::Status { status, .. } if status == StatusCode::NOT_FOUND
        ));
        assert_eq!(request_count(&requests), 1);
    }

    #[tokio::test]
    async fn test_send_never_repeats_post() {
        let (endpoint, requests) = serve(vec![reply(503, ""), reply(200, "{}")]).await;
        let client = HubClient::new(&endpoint, None, fast_retry()).unwrap();

        let err = client
            .send(Method::POST, &format!("{}/api/x", endpoint))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Status { .. }));
        assert_eq!(request_count(&requests), 1);
        assert!(requests.lock().unwrap()[0].starts_with("POST "));
    }

    #[tokio::test]
    async fn test_login_sends_bearer_token() {
        let (endpoint, requests) = serve(vec![reply(200, r#"{"name":"alice"}"#)]).await;
        let client = HubClient::new(&endpoint, Some("secret".to_string()), fast_retry()).unwrap();

        assert_eq!(client.login().await.unwrap().as_deref(), Some("alice"));
        let head = requests.lock().unwrap()[0].to_ascii_lowercase();
        assert!(head.starts_with("get /api/whoami-v2 "));
        assert!(head.contains("authorization: bearer secret"));

        let anonymous = HubClient::new(&endpoint, None, fast_retry()).unwrap();
        assert_eq!(anonymous.login().await.unwrap(), None);
        assert_eq!(request_count(&requests), 1);
    }

    #[tokio::test]
    async fn test_interrupted_download_removes_temp_file() {
        let truncated = Reply {
            status: 200,
            body: "GGUF",
            length: Some(1000),
        };
        let (endpoint, _requests) = serve(vec![truncated]).await;
        let client = HubClient::new(&endpoint, None, fast_retry()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let hf_url = HuggingFaceUrl {
            repo_id: "owner/repo".to_string(),
            filename: "model.gguf".to_string(),
            revision: "main".to_string(),
        };

        let result = client.download(&hf_url, dir.path(), |_, _| {}).await;
        assert!(result.is_err());
        assert!(!dir.path().join("model.gguf.tmp").exists());
        assert!(!dir.path().join("model.gguf").exists());
    }

    #[test]
    fn test_parse_hf_url_full() {
        let url = "https://huggingface.co/TheBloke/deepseek-llm-7B-chat-GGUF/blob/main/deepseek-llm-7b-chat.Q4_K_M.gguf";
        let parsed = HuggingFaceUrl::parse(url).unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/deepseek-llm-7B-chat-GGUF");
        assert_eq!(parsed.filename, "deepseek-llm-7b-chat.Q4_K_M.gguf");
        assert_eq!(parsed.revision, "main");
    }

    #[test]
    fn test_parse_hf_url_short() {
        let parsed = HuggingFaceUrl::parse("TheBloke/Llama-2-7B-GGUF/llama-2-7b.Q4_K_M.gguf").unwrap();
        assert_eq!(parsed.repo_id, "TheBloke/Llama-2-7B-GGUF");
        assert_eq!(parsed.filename, "llama-2-7b.Q4_K_M.gguf");
    }

    #[test]
    fn test_parse_hf_url_repo_only() {
        let parsed = HuggingFaceUrl::parse("deepseek-ai/deepseek-llm-7b-chat").unwrap();
        assert_eq!(parsed.repo_id, "deepseek-ai/deepseek-llm-7b-chat");
        assert_eq!(parsed.filename, "");
        assert!(HuggingFaceUrl::parse("just-a-name").is_err());
    }

    #[test]
    fn test_retry_policy_filters() {
        let policy = RetryPolicy::default();
        assert!(policy.allows_method(&Method::GET));
        assert!(policy.allows_method(&Method::HEAD));
        assert!(!policy.allows_method(&Method::POST));
        assert!(policy.retries_status(StatusCode::SERVICE_UNAVAILABLE));
        assert!(policy.retries_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!policy.retries_status(StatusCode::NOT_FOUND));
        assert!(!policy.retries_status(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_retry_backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn test_choose_gguf_prefers_q4_k_m() {
        let files = vec![
            "model.Q2_K.gguf".to_string(),
            "model.Q4_K_M.gguf".to_string(),
            "model.Q8_0.gguf".to_string(),
        ];
        assert_eq!(choose_gguf("a/b", files).unwrap(), "model.Q4_K_M.gguf");
        assert!(matches!(choose_gguf("a/b", vec![]), Err(HubError::NoGgufFiles(_))));
        let files = vec!["x.Q2_K.gguf".to_string(), "x.Q8_0.gguf".to_string()];
        assert!(matches!(
            choose_gguf("a/b", files),
            Err(HubError::AmbiguousGguf { .. })
        ));
    }

    #[test]
    fn test_sanitize_local_filename() {
        assert_eq!(
            sanitize_local_filename("sub/dir/model.gguf").unwrap(),
            "sub__dir__model.gguf"
        );
        assert_eq!(sanitize_local_filename("a:b?.gguf").unwrap(), "a_b_.gguf");
        assert!(sanitize_local_filename("  ").is_err());
    }

    #[tokio::test]
    async fn test_resolve_local_file_skips_hub() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("tiny.gguf");
        std::fs::write(&model, b"GGUF").unwrap();

        let client = HubClient::new("http://127.0.0.1:9", None, RetryPolicy::default()).unwrap();
        let resolved = client
            .resolve(model.to_str().unwrap(), dir.path())
            .await
            .unwrap();
        assert_eq!(resolved, model);

        let missing = client
            .resolve("./no/such/model.gguf", dir.path())
            .await;
        assert!(matches!(missing, Err(HubError::LocalFileMissing(_))));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(3 * 1024 * 1024 * 1024), "3.00 GB");
    }
}

//! Data Lake Storage Gen2 backend over the DFS REST API.

use super::retry::RetryPolicy;
use super::shared_key::SharedKeyCredential;
use super::{
    is_success, is_transient_status, normalize_path, AclChangeBatch, AclFailedEntry, Directory, Page, PathEntry,
    PathProperties, StorageContainer, StorageError, StorageService, ROOT_PATH,
};
use crate::acl::{AccessControlEntry, AclMode};
use crate::config::StorageConfig;
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, Url};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

const API_VERSION: &str = "2021-06-08";
const CONTINUATION_HEADER: &str = "x-ms-continuation";
const PROPERTIES_HEADER: &str = "x-ms-properties";

/// Connection to one storage account. Dropping it releases the pooled client.
pub struct DataLakeClient {
    http: reqwest::Client,
    endpoint: Url,
    credential: SharedKeyCredential,
    retry: RetryPolicy,
    reuse_existing: bool,
}

impl std::fmt::Debug for DataLakeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataLakeClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("credential", &self.credential)
            .finish_non_exhaustive()
    }
}

/// A request that can be signed and sent again on retry.
struct Request<'a> {
    method: Method,
    url: Url,
    headers: HeaderMap,
    container: &'a str,
    path: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct SetAclResponse {
    #[serde(default)]
    directories_successful: u64,
    #[serde(default)]
    files_successful: u64,
    #[serde(default)]
    failure_count: u64,
    #[serde(default)]
    failed_entries: Vec<FailedEntryBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FailedEntryBody {
    name: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
struct FileSystemList {
    #[serde(default)]
    filesystems: Vec<FileSystemBody>,
}

#[derive(Deserialize)]
struct FileSystemBody {
    name: String,
}

#[derive(Deserialize)]
struct PathList {
    #[serde(default)]
    paths: Vec<PathBody>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PathBody {
    name: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    is_directory: bool,
    #[serde(default, deserialize_with = "lenient_u64")]
    content_length: u64,
}

// The service sends some booleans and numbers as JSON strings.
fn lenient_bool<'de, D: Deserializer<'de>>(de: D) -> Result<bool, D::Error> {
    Ok(match serde_json::Value::deserialize(de)? {
        serde_json::Value::Bool(b) => b,
        serde_json::Value::String(s) => s.eq_ignore_ascii_case("true"),
        _ => false,
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(de: D) -> Result<u64, D::Error> {
    Ok(match serde_json::Value::deserialize(de)? {
        serde_json::Value::Number(n) => n.as_u64().unwrap_or_default(),
        serde_json::Value::String(s) => s.parse().unwrap_or_default(),
        _ => 0,
    })
}

impl DataLakeClient {
    /// Build a client and verify the account answers a minimal listing.
    pub async fn connect(config: &StorageConfig) -> Result<Self, StorageError> {
        let client = Self::new(config)?;
        client.handshake().await?;
        info!("connected to storage account {}", config.account_name);
        Ok(client)
    }

    /// Build a client without contacting the service.
    pub fn new(config: &StorageConfig) -> Result<Self, StorageError> {
        let endpoint = Url::parse(&config.service_uri).map_err(|e| {
            StorageError::Configuration(format!("storageServiceUri is not a valid URL: {e}"))
        })?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(StorageError::Configuration(
                "storageServiceUri must use http or https".to_string(),
            ));
        }
        let credential = SharedKeyCredential::new(&config.account_name, &config.account_key)?;
        let http = reqwest::Client::builder()
            .timeout(config.retry.timeout)
            .build()
            .map_err(|e| StorageError::Configuration(format!("HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint,
            credential,
            retry: config.retry.clone(),
            reuse_existing: config.reuse_existing_directories,
        })
    }

    async fn handshake(&self) -> Result<(), StorageError> {
        let mut url = self.endpoint.clone();
        url.set_path("/");
        url.query_pairs_mut()
            .append_pair("resource", "account")
            .append_pair("maxResults", "1");
        let request = Request {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            container: "",
            path: "",
        };
        // a single attempt: an unreachable endpoint is a configuration problem
        let policy = RetryPolicy::none(self.retry.timeout);
        match policy.run("handshake", || self.send_once(&request)).await {
            Ok(_) => Ok(()),
            Err(StorageError::Transient(msg)) => Err(StorageError::Configuration(format!(
                "storage endpoint {} unreachable: {msg}",
                self.endpoint
            ))),
            Err(StorageError::Permission { status, .. }) => Err(StorageError::Configuration(
                format!("storage account rejected the credential ({status})"),
            )),
            Err(other) => Err(other),
        }
    }

    /// URL of `path` inside `container`. The root resolves to `/{container}/`.
    fn path_url(&self, container: &str, path: &str) -> Result<Url, StorageError> {
        let normalized = normalize_path(path)?;
        let mut url = self.endpoint.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::Configuration("storageServiceUri cannot be a base".into()))?;
            segments.clear().push(container);
            if normalized == ROOT_PATH {
                segments.push("");
            } else {
                segments.extend(normalized.trim_start_matches('/').split('/'));
            }
        }
        Ok(url)
    }

    async fn send(&self, operation: &str, request: &Request<'_>) -> Result<Response, StorageError> {
        self.retry.run(operation, || self.send_once(request)).await
    }

    async fn send_once(&self, request: &Request<'_>) -> Result<Response, StorageError> {
        let response = self.dispatch(request).await?;
        if is_success(response.status().as_u16()) {
            return Ok(response);
        }
        Err(error_from_response(response, request.container, request.path).await)
    }

    /// Sign and send one attempt. The response comes back whatever its status.
    async fn dispatch(&self, request: &Request<'_>) -> Result<Response, StorageError> {
        let mut headers = request.headers.clone();
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        headers.insert("x-ms-date", header(&date)?);
        headers.insert("x-ms-version", HeaderValue::from_static(API_VERSION));
        headers.insert(
            "x-ms-client-request-id",
            header(&Uuid::new_v4().to_string())?,
        );
        if matches!(request.method, Method::PUT | Method::PATCH) {
            headers.insert(reqwest::header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        }
        let authorization = self
            .credential
            .authorization(&request.method, &request.url, &headers);
        headers.insert(reqwest::header::AUTHORIZATION, header(&authorization)?);

        debug!("{} {}", request.method, request.url.path());
        self.http
            .request(request.method.clone(), request.url.clone())
            .headers(headers)
            .send()
            .await
            .map_err(transport_error)
    }

    fn request<'a>(
        &self,
        method: Method,
        container: &'a str,
        path: &'a str,
        query: &[(&str, &str)],
    ) -> Result<Request<'a>, StorageError> {
        let mut url = self.path_url(container, path)?;
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(Request {
            method,
            url,
            headers: HeaderMap::new(),
            container,
            path,
        })
    }
}

fn header(value: &str) -> Result<HeaderValue, StorageError> {
    HeaderValue::from_str(value)
        .map_err(|_| StorageError::Protocol(format!("invalid header value `{value}`")))
}

fn transport_error(err: reqwest::Error) -> StorageError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        StorageError::Transient(err.to_string())
    } else {
        StorageError::Protocol(err.to_string())
    }
}

async fn error_from_response(response: Response, container: &str, path: &str) -> StorageError {
    let status = response.status().as_u16();
    let header_code = response
        .headers()
        .get("x-ms-error-code")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(parsed) => (
            parsed.error.code.or(header_code),
            parsed.error.message.unwrap_or_default(),
        ),
        Err(_) => (header_code, body),
    };
    let message = match &code {
        Some(code) if message.is_empty() => code.clone(),
        _ => message,
    };
    StorageError::from_status(status, code.as_deref(), message, container, path)
}

fn continuation(response: &Response) -> Option<String> {
    response
        .headers()
        .get(CONTINUATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn header_str<'a>(response: &'a Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Encode metadata as `x-ms-properties`: `key=base64(value)` pairs.
pub(crate) fn encode_properties(metadata: &BTreeMap<String, String>) -> Result<String, StorageError> {
    let mut pairs = Vec::with_capacity(metadata.len());
    for (key, value) in metadata {
        if key.is_empty() || !key.is_ascii() || key.contains([',', '=']) {
            return Err(StorageError::Protocol(format!("invalid metadata key `{key}`")));
        }
        pairs.push(format!("{key}={}", STANDARD.encode(value.as_bytes())));
    }
    Ok(pairs.join(","))
}

pub(crate) fn decode_properties(raw: &str) -> BTreeMap<String, String> {
    raw.split(',')
        .filter_map(|pair| pair.split_once('='))
        .filter_map(|(key, value)| {
            let bytes = STANDARD.decode(value.trim()).ok()?;
            Some((key.trim().to_string(), String::from_utf8(bytes).ok()?))
        })
        .collect()
}

#[async_trait]
impl StorageService for DataLakeClient {
    async fn create_directory(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Directory, StorageError> {
        let mut request = self.request(Method::PUT, container, path, &[("resource", "directory")])?;
        if !self.reuse_existing {
            // create-if-absent: the service answers 409 PathAlreadyExists
            request
                .headers
                .insert(reqwest::header::IF_NONE_MATCH, HeaderValue::from_static("*"));
        }
        self.send("create directory", &request).await?;
        Ok(Directory {
            container: container.to_string(),
            path: normalize_path(path)?,
            created_at: Utc::now(),
        })
    }

    async fn get_access_control(
        &self,
        container: &str,
        path: &str,
    ) -> Result<Vec<AccessControlEntry>, StorageError> {
        let request = self.request(
            Method::HEAD,
            container,
            path,
            &[("action", "getAccessControl"), ("upn", "false")],
        )?;
        let response = self.send("get access control", &request).await?;
        let acl = header_str(&response, "x-ms-acl").unwrap_or_default();
        AccessControlEntry::parse_list(acl).map_err(|e| StorageError::Protocol(e.to_string()))
    }

    async fn set_access_control_recursive(
        &self,
        container: &str,
        path: &str,
        entries: &[AccessControlEntry],
        mode: AclMode,
        continuation_token: Option<&str>,
        max_records: u32,
    ) -> Result<AclChangeBatch, StorageError> {
        let max_records = max_records.to_string();
        let mut query = vec![
            ("action", "setAccessControlRecursive"),
            ("mode", mode.as_str()),
            ("maxRecords", max_records.as_str()),
        ];
        if let Some(token) = continuation_token {
            query.push(("continuation", token));
        }
        let mut request = self.request(Method::PATCH, container, path, &query)?;
        request.headers.insert(
            HeaderName::from_static("x-ms-acl"),
            header(&AccessControlEntry::format_list(entries))?,
        );

        // transient statuses are retried; one that outlasts the retries is
        // reported as the batch status like any other rejection
        let last_status = Mutex::new(None);
        let (req, last) = (&request, &last_status);
        let outcome = self
            .retry
            .run("set access control recursive", move || async move {
                *last.lock() = None;
                let response = self.dispatch(req).await?;
                let status = response.status().as_u16();
                match status {
                    401 | 403 | 404 => Err(error_from_response(response, req.container, req.path).await),
                    _ if is_transient_status(status) => {
                        *last.lock() = Some(status);
                        Err(error_from_response(response, req.container, req.path).await)
                    }
                    _ => Ok(response),
                }
            })
            .await;
        let exhausted = last_status.lock().take();
        let response = match (outcome, exhausted) {
            (Ok(response), _) => response,
            (Err(err), Some(status)) => {
                debug!("set access control recursive gave up on status {status}: {err}");
                return Ok(AclChangeBatch {
                    status,
                    directories_successful: 0,
                    files_successful: 0,
                    failure_count: 0,
                    failed_entries: Vec::new(),
                    continuation: continuation_token.map(str::to_string),
                });
            }
            (Err(err), None) => return Err(err),
        };

        let status = response.status().as_u16();
        let next = continuation(&response);
        let text = response.text().await.map_err(transport_error)?;
        let body: SetAclResponse = if is_success(status) {
            serde_json::from_str(&text).map_err(|e| StorageError::Protocol(e.to_string()))?
        } else {
            // error bodies carry no counts
            serde_json::from_str(&text).unwrap_or_default()
        };
        Ok(AclChangeBatch {
            status,
            directories_successful: body.directories_successful,
            files_successful: body.files_successful,
            failure_count: body.failure_count,
            failed_entries: body
                .failed_entries
                .into_iter()
                .map(|e| AclFailedEntry {
                    is_directory: e.kind.eq_ignore_ascii_case("directory"),
                    name: e.name,
                    error_message: e.error_message,
                })
                .collect(),
            continuation: next,
        })
    }

    async fn write_metadata(
        &self,
        container: &str,
        path: &str,
        metadata: &BTreeMap<String, String>,
    ) -> Result<(), StorageError> {
        let mut request = self.request(Method::PATCH, container, path, &[("action", "setProperties")])?;
        request.headers.insert(
            HeaderName::from_static(PROPERTIES_HEADER),
            header(&encode_properties(metadata)?)?,
        );
        self.send("write metadata", &request).await?;
        Ok(())
    }

    async fn get_properties(
        &self,
        container: &str,
        path: &str,
    ) -> Result<PathProperties, StorageError> {
        let request = self.request(Method::HEAD, container, path, &[])?;
        let response = self.send("get properties", &request).await?;
        Ok(PathProperties {
            is_directory: header_str(&response, "x-ms-resource-type") == Some("directory"),
            content_length: header_str(&response, "content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            access_tier: header_str(&response, "x-ms-access-tier").map(str::to_string),
            metadata: header_str(&response, PROPERTIES_HEADER)
                .map(decode_properties)
                .unwrap_or_default(),
        })
    }

    async fn list_containers(
        &self,
        continuation_token: Option<&str>,
    ) -> Result<Page<StorageContainer>, StorageError> {
        let mut url = self.endpoint.clone();
        url.set_path("/");
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("resource", "account");
            if let Some(token) = continuation_token {
                pairs.append_pair("continuation", token);
            }
        }
        let request = Request {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            container: "",
            path: "",
        };
        let response = self.send("list containers", &request).await?;
        let next = continuation(&response);
        let body: FileSystemList = response
            .json()
            .await
            .map_err(|e| StorageError::Protocol(e.to_string()))?;
        Ok(Page {
            items: body
                .filesystems
                .into_iter()
                .map(|fs| StorageContainer { name: fs.name })
                .collect(),
            continuation: next,
        })
    }

    async fn list_paths(
        &self,
        container: &str,
        directory: Option<&str>,
        recursive: bool,
        continuation_token: Option<&str>,
    ) -> Result<Page<PathEntry>, StorageError> {
        let directory = directory.map(normalize_path).transpose()?;
        let mut url = self.endpoint.clone();
        url.set_path(&format!("/{container}"));
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("resource", "filesystem")
                .append_pair("recursive", if recursive { "true" } else { "false" });
            if let Some(dir) = directory.as_deref().filter(|d| *d != ROOT_PATH) {
                pairs.append_pair("directory", dir.trim_start_matches('/'));
            }
            if let Some(token) = continuation_token {
                pairs.append_pair("continuation", token);
            }
        }
        let request = Request {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            container,
            path: directory.as_deref().unwrap_or(ROOT_PATH),
        };
        let response = self.send("list paths", &request).await?;
        let next = continuation(&response);
        let body: PathList = response
            .json()
            .await
            .map_err(|e| StorageError::Protocol(e.to_string()))?;
        Ok(Page {
            items: body
                .paths
                .into_iter()
                .map(|p| PathEntry {
                    name: p.name,
                    is_directory: p.is_directory,
                    content_length: p.content_length,
                })
                .collect(),
            continuation: next,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::{AclEngine, AclError, AclScope, PropagationLimits};
    use crate::cancel::Cancellation;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn config(uri: &str) -> StorageConfig {
        StorageConfig::from_lookup(|key| match key {
            "storageAccountName" => Some("fundsaccount".into()),
            "storageAccountKey" => Some("dGVuYW50LWh1Yi10ZXN0LWtleQ==".into()),
            "storageServiceUri" => Some(uri.into()),
            "storageRootContainer" => Some("funds".into()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn builds_path_urls() {
        let client = DataLakeClient::new(&config("https://fundsaccount.dfs.core.windows.net")).unwrap();
        assert_eq!(
            client.path_url("funds", "/alpha/2024").unwrap().as_str(),
            "https://fundsaccount.dfs.core.windows.net/funds/alpha/2024"
        );
        assert_eq!(
            client.path_url("funds", "/").unwrap().as_str(),
            "https://fundsaccount.dfs.core.windows.net/funds/"
        );
        assert_eq!(
            client.path_url("funds", "q3 report").unwrap().as_str(),
            "https://fundsaccount.dfs.core.windows.net/funds/q3%20report"
        );
        assert!(client.path_url("funds", "/alpha/../beta").is_err());
    }

    #[test]
    fn rejects_bad_endpoint() {
        let err = DataLakeClient::new(&config("not a url")).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
        let err = DataLakeClient::new(&config("ftp://fundsaccount")).unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)));
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_configuration_error() {
        // port 9 on loopback is not served
        let mut cfg = config("http://127.0.0.1:9");
        cfg.retry = RetryPolicy::none(std::time::Duration::from_secs(2));
        let err = DataLakeClient::connect(&cfg).await.unwrap_err();
        assert!(matches!(err, StorageError::Configuration(_)), "{err:?}");
    }

    #[test]
    fn properties_round_trip_through_base64() {
        let mut metadata = BTreeMap::new();
        metadata.insert("tenantCode".to_string(), "F-0042".to_string());
        let encoded = encode_properties(&metadata).unwrap();
        assert_eq!(encoded, "tenantCode=Ri0wMDQy");
        assert_eq!(decode_properties(&encoded), metadata);
    }

    #[test]
    fn parses_string_typed_listing_fields() {
        let body = r#"{"paths":[
            {"name":"alpha","isDirectory":"true","contentLength":"0"},
            {"name":"alpha/a.csv","contentLength":1234}
        ]}"#;
        let list: PathList = serde_json::from_str(body).unwrap();
        assert!(list.paths[0].is_directory);
        assert!(!list.paths[1].is_directory);
        assert_eq!(list.paths[1].content_length, 1234);
    }

    #[test]
    fn parses_set_acl_response() {
        let body = r#"{"directoriesSuccessful":3,"filesSuccessful":10,"failureCount":1,
            "failedEntries":[{"name":"alpha/locked","type":"DIRECTORY","errorMessage":"denied"}]}"#;
        let parsed: SetAclResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.directories_successful, 3);
        assert_eq!(parsed.files_successful, 10);
        assert_eq!(parsed.failure_count, 1);
        assert_eq!(parsed.failed_entries[0].kind, "DIRECTORY");
    }

    /// Serve every request on loopback with the same canned response.
    async fn canned(status: &str, headers: &str, body: &str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n{headers}\r\n{body}",
            body.len()
        );
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn engine_over(uri: &str) -> AclEngine {
        let mut cfg = config(uri);
        cfg.retry = RetryPolicy::none(Duration::from_secs(5));
        let client = DataLakeClient::new(&cfg).unwrap();
        AclEngine::new(Arc::new(client), PropagationLimits::default())
    }

    #[tokio::test]
    async fn rejected_recursive_update_is_reported_as_a_status() {
        let uri = canned(
            "400 Bad Request",
            "x-ms-error-code: InvalidInput\r\n",
            r#"{"error":{"code":"InvalidInput","message":"bad"}}"#,
        )
        .await;
        let err = engine_over(&uri)
            .grant_traversal("funds", "user123", AclScope::Access, &Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err, AclError::Rejected { status: 400 });
    }

    #[tokio::test]
    async fn persistent_server_error_is_reported_as_a_status() {
        let uri = canned("503 Service Unavailable", "", r#"{"error":{"code":"ServerBusy"}}"#).await;
        let err = engine_over(&uri)
            .grant_traversal("funds", "user123", AclScope::Access, &Cancellation::never())
            .await
            .unwrap_err();
        assert_eq!(err, AclError::Rejected { status: 503 });
    }

    #[tokio::test]
    async fn missing_container_stays_a_storage_error() {
        let uri = canned("404 Not Found", "", r#"{"error":{"code":"FilesystemNotFound"}}"#).await;
        let err = engine_over(&uri)
            .grant_traversal("funds", "user123", AclScope::Access, &Cancellation::never())
            .await
            .unwrap_err();
        assert!(
            matches!(err, AclError::Storage(StorageError::NotFound { .. })),
            "{err:?}"
        );
    }

    #[tokio::test]
    async fn successful_recursive_update_reports_counts() {
        let uri = canned(
            "200 OK",
            "",
            r#"{"directoriesSuccessful":2,"filesSuccessful":1,"failureCount":0}"#,
        )
        .await;
        let report = engine_over(&uri)
            .grant_traversal("funds", "user123", AclScope::Access, &Cancellation::never())
            .await
            .unwrap();
        assert_eq!(report.directories_changed, 2);
        assert_eq!(report.files_changed, 1);
        assert_eq!(report.rounds, 1);
    }
}

//! HTTP registry client.
//!
//! Speaks the `/api/v1` contract. Every call carries a timeout; failures that
//! might succeed on retry (connect errors, timeouts, 5xx) are retried with
//! exponential backoff up to a fixed budget. Any 4xx response fails at once.

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use plinth_schema::{
    PackageIdentity, PackageMetadata, PackageSummary, PackageVersion, TagName, Version,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ArchiveHandle, PublishRequest, Registry};
use crate::archive::ArchiveLimits;
use crate::error::{Error, ErrorCode, Result};
use crate::verify::checksum;

/// Header carrying the dist-tag on publish.
pub const TAG_HEADER: &str = "x-plinth-tag";
/// Header carrying the archive checksum on publish.
pub const CHECKSUM_HEADER: &str = "x-plinth-checksum";
/// Header carrying the base64 JSON signature record on publish.
pub const SIGNATURE_HEADER: &str = "x-plinth-signature";

/// Client tuning for a [`RemoteRegistry`].
#[derive(Debug, Clone)]
pub struct RemoteOptions {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time.
    pub backoff: Duration,
    /// Bearer token for write endpoints.
    pub token: Option<String>,
    /// Download size cap.
    pub limits: ArchiveLimits,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            backoff: Duration::from_millis(250),
            token: None,
            limits: ArchiveLimits::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: ErrorCode,
    #[serde(default)]
    message: String,
}

/// Client for one HTTP registry.
#[derive(Debug)]
pub struct RemoteRegistry {
    name: String,
    base: String,
    client: Client,
    options: RemoteOptions,
}

impl RemoteRegistry {
    /// Client for the registry at `url` (without the `/api/v1` suffix).
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be built.
    pub fn new(name: impl Into<String>, url: &str, options: RemoteOptions) -> Result<Self> {
        let client = Client::builder()
            .timeout(options.timeout)
            .user_agent(crate::USER_AGENT)
            .build()?;
        Ok(Self {
            name: name.into(),
            base: format!("{}/api/v1", url.trim_end_matches('/')),
            client,
            options,
        })
    }

    fn package_url(&self, identity: &PackageIdentity) -> String {
        format!("{}/packages/{identity}", self.base)
    }

    fn version_url(&self, identity: &PackageIdentity, version: &Version) -> String {
        format!("{}/versions/{version}", self.package_url(identity))
    }

    fn token(&self) -> Result<&str> {
        self.options.token.as_deref().ok_or_else(|| Error::Registry {
            registry: self.name.clone(),
            code: ErrorCode::Unauthorized,
            status: 401,
            message: "no token configured for write operations".to_string(),
        })
    }

    /// Send a request, retrying transient failures.
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder + Send + Sync,
    {
        let mut attempt = 0u32;
        loop {
            let err = match build().send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => self.error_from(resp).await,
                Err(e) => Error::Http(e),
            };
            if !err.is_transient() || attempt >= self.options.max_retries {
                return Err(err);
            }
            let delay = self.options.backoff.saturating_mul(2u32.saturating_pow(attempt));
            attempt += 1;
            tracing::warn!(registry = %self.name, attempt, ?delay, "retrying after: {err}");
            tokio::time::sleep(delay).await;
        }
    }

    async fn error_from(&self, resp: Response) -> Error {
        let status = resp.status().as_u16();
        let body = resp.bytes().await.unwrap_or_default();
        let (code, message) = match serde_json::from_slice::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.code, parsed.message),
            Err(_) => (
                ErrorCode::from_status(status),
                String::from_utf8_lossy(&body).trim().to_string(),
            ),
        };
        Error::Registry {
            registry: self.name.clone(),
            code,
            status,
            message,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.send(|| self.client.get(url)).await?;
        Ok(resp.json().await?)
    }

    /// Record for one published version.
    ///
    /// # Errors
    ///
    /// Returns a registry error (`version_not_found` etc.) or a transport error.
    pub async fn get_version(&self, identity: &PackageIdentity, version: &Version) -> Result<PackageVersion> {
        self.get_json(&self.version_url(identity, version)).await
    }
}

#[async_trait]
impl Registry for RemoteRegistry {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<PackageSummary>> {
        let url = format!("{}/search", self.base);
        let resp = self
            .send(|| self.client.get(&url).query(&[("q", query)]))
            .await?;
        Ok(resp.json().await?)
    }

    async fn get_metadata(&self, identity: &PackageIdentity) -> Result<PackageMetadata> {
        let mut meta: PackageMetadata = self.get_json(&self.package_url(identity)).await?;
        meta.sync_tag_memberships();
        Ok(meta)
    }

    async fn resolve_tag(&self, identity: &PackageIdentity, tag: &TagName) -> Result<Version> {
        let url = format!("{}/tags", self.package_url(identity));
        let tags: BTreeMap<TagName, Version> = self.get_json(&url).await?;
        tags.get(tag).cloned().ok_or_else(|| Error::Registry {
            registry: self.name.clone(),
            code: ErrorCode::TagNotFound,
            status: 404,
            message: format!("{identity} has no tag '{tag}'"),
        })
    }

    async fn fetch_archive(
        &self,
        identity: &PackageIdentity,
        version: &Version,
        dest: &Path,
    ) -> Result<ArchiveHandle> {
        let url = format!("{}/download", self.version_url(identity, version));
        let resp = self.send(|| self.client.get(&url)).await?;

        let limit = self.options.limits.max_uncompressed_bytes;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = resp.bytes_stream();
        let mut size: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(e.into());
                }
            };
            size += chunk.len() as u64;
            if size > limit {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(Error::Archive(format!(
                    "{identity}@{version} exceeds the {limit} byte download limit"
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(ArchiveHandle {
            identity: identity.clone(),
            version: version.clone(),
            path: dest.to_path_buf(),
            size,
        })
    }

    async fn publish(&self, request: PublishRequest) -> Result<PackageVersion> {
        let token = self.token()?;
        let PublishRequest {
            archive: bytes,
            tag,
            signature,
        } = request;
        let limits = self.options.limits;
        let (manifest, bytes) = tokio::task::spawn_blocking(move || {
            crate::archive::inspect(&bytes, limits).map(|manifest| (manifest, bytes))
        })
        .await
        .map_err(|e| Error::context("inspecting archive", e))??;
        let url = self.version_url(&manifest.package.name, &manifest.package.version);
        let digest = checksum(&bytes).to_string();
        let signature = signature
            .as_ref()
            .map(|s| serde_json::to_vec(s).map(|json| STANDARD.encode(json)))
            .transpose()?;

        let resp = self
            .send(|| {
                let mut req = self
                    .client
                    .put(&url)
                    .bearer_auth(token)
                    .header(reqwest::header::CONTENT_TYPE, "application/gzip")
                    .header(CHECKSUM_HEADER, &digest)
                    .body(bytes.clone());
                if let Some(tag) = &tag {
                    req = req.header(TAG_HEADER, tag.as_str());
                }
                if let Some(sig) = &signature {
                    req = req.header(SIGNATURE_HEADER, sig);
                }
                req
            })
            .await?;
        Ok(resp.json().await?)
    }

    async fn set_tag(&self, identity: &PackageIdentity, tag: &TagName, version: &Version) -> Result<()> {
        let token = self.token()?;
        let url = format!("{}/tags/{tag}", self.package_url(identity));
        let body = serde_json::json!({ "version": version.to_string() });
        self.send(|| self.client.put(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }

    async fn remove_tag(&self, identity: &PackageIdentity, tag: &TagName) -> Result<()> {
        let token = self.token()?;
        let url = format!("{}/tags/{tag}", self.package_url(identity));
        self.send(|| self.client.delete(&url).bearer_auth(token)).await?;
        Ok(())
    }

    async fn yank(&self, identity: &PackageIdentity, version: &Version, yanked: bool) -> Result<()> {
        let token = self.token()?;
        let url = format!("{}/yank", self.version_url(identity, version));
        let body = serde_json::json!({ "yanked": yanked });
        self.send(|| self.client.put(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn options() -> RemoteOptions {
        RemoteOptions {
            timeout: Duration::from_secs(5),
            max_retries: 2,
            backoff: Duration::from_millis(1),
            token: Some("secret".into()),
            limits: ArchiveLimits::default(),
        }
    }

    fn metadata_json() -> String {
        let digest = "ab".repeat(32);
        format!(
            r#"{{
                "identity": "demo",
                "description": "demo rules",
                "versions": [
                    {{"identity": "demo", "version": "1.0.0", "checksum": "{digest}", "size": 10}},
                    {{"identity": "demo", "version": "1.1.0", "checksum": "{digest}", "size": 12,
                      "dependencies": {{"base": "^1.0.0"}}}},
                    {{"identity": "demo", "version": "2.0.0", "checksum": "{digest}", "size": 12, "yanked": true}}
                ],
                "dist_tags": {{"latest": "1.1.0"}}
            }}"#
        )
    }

    fn demo() -> PackageIdentity {
        "demo".parse().unwrap()
    }

    #[tokio::test]
    async fn reads_metadata_and_tag_memberships() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/packages/demo")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(metadata_json())
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let meta = reg.get_metadata(&demo()).await.unwrap();
        assert_eq!(meta.versions.len(), 3);
        assert!(meta.versions[1].has_tag(&TagName::latest()));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn list_versions_filters_yanked() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/packages/demo")
            .with_status(200)
            .with_body(metadata_json())
            .expect(2)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        assert_eq!(reg.list_versions(&demo(), false).await.unwrap().len(), 2);
        assert_eq!(reg.list_versions(&demo(), true).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn structured_errors_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/packages/ghost")
            .with_status(404)
            .with_body(r#"{"code": "package_not_found", "message": "no such package"}"#)
            .expect(1)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let err = reg.get_metadata(&"ghost".parse().unwrap()).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(err, Error::Registry { status: 404, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_are_retried_within_budget() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/packages/demo")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let err = reg.get_metadata(&demo()).await.unwrap_err();
        assert!(matches!(err, Error::Registry { status: 503, code: ErrorCode::Internal, .. }));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rate_limits_are_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/packages/demo")
            .with_status(429)
            .with_body(r#"{"code": "rate_limited", "message": "slow down"}"#)
            .expect(1)
            .create_async()
            .await;

        let mut opts = options();
        opts.max_retries = 3;
        let reg = RemoteRegistry::new("remote", &server.url(), opts).unwrap();
        let err = reg.get_metadata(&demo()).await.unwrap_err();
        assert!(matches!(err, Error::Registry { status: 429, code: ErrorCode::RateLimited, .. }));
        assert!(!err.is_transient());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn publish_sends_archive_with_checksum() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(plinth_schema::MANIFEST_FILE),
            "[package]\nname = \"demo\"\nversion = \"1.0.0\"\n",
        )
        .unwrap();
        let bytes = crate::archive::pack_dir(dir.path()).unwrap();
        let digest = checksum(&bytes);

        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v1/packages/demo/versions/1.0.0")
            .match_header("authorization", "Bearer secret")
            .match_header(CHECKSUM_HEADER, digest.to_string().as_str())
            .with_status(201)
            .with_body(format!(
                r#"{{"identity": "demo", "version": "1.0.0", "checksum": "{digest}", "size": {}}}"#,
                bytes.len()
            ))
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let record = reg.publish(PublishRequest::new(bytes)).await.unwrap();
        assert_eq!(record.checksum, digest);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unknown_error_codes_map_to_unknown() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/packages/demo")
            .with_status(418)
            .with_body(r#"{"code": "teapot", "message": "short and stout"}"#)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let err = reg.get_metadata(&demo()).await.unwrap_err();
        assert!(matches!(err, Error::Registry { code: ErrorCode::Unknown, status: 418, .. }));
    }

    #[tokio::test]
    async fn resolves_tags_and_reports_missing_ones() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/packages/demo/tags")
            .with_status(200)
            .with_body(r#"{"latest": "1.1.0", "beta": "2.0.0-rc.1"}"#)
            .expect(2)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let beta: TagName = "beta".parse().unwrap();
        assert_eq!(reg.resolve_tag(&demo(), &beta).await.unwrap().to_string(), "2.0.0-rc.1");
        let err = reg
            .resolve_tag(&demo(), &"nightly".parse().unwrap())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn downloads_stream_to_disk() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/packages/demo/versions/1.0.0/download")
            .with_status(200)
            .with_body(vec![1u8; 4096])
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("demo.tar.gz");
        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        let handle = reg
            .fetch_archive(&demo(), &"1.0.0".parse().unwrap(), &dest)
            .await
            .unwrap();
        assert_eq!(handle.size, 4096);
        assert_eq!(std::fs::read(&dest).unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn oversize_downloads_are_discarded() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/api/v1/packages/demo/versions/1.0.0/download")
            .with_status(200)
            .with_body(vec![1u8; 4096])
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("demo.tar.gz");
        let mut opts = options();
        opts.limits.max_uncompressed_bytes = 1024;
        let reg = RemoteRegistry::new("remote", &server.url(), opts).unwrap();
        let err = reg
            .fetch_archive(&demo(), &"1.0.0".parse().unwrap(), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archive(_)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn writes_send_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/api/v1/packages/demo/versions/1.0.0/yank")
            .match_header("authorization", "Bearer secret")
            .match_body(Matcher::Json(serde_json::json!({"yanked": true})))
            .with_status(204)
            .create_async()
            .await;

        let reg = RemoteRegistry::new("remote", &server.url(), options()).unwrap();
        reg.yank(&demo(), &"1.0.0".parse().unwrap(), true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn writes_without_token_fail_locally() {
        let server = Server::new_async().await;
        let mut opts = options();
        opts.token = None;
        let reg = RemoteRegistry::new("remote", &server.url(), opts).unwrap();
        let err = reg
            .set_tag(&demo(), &"stable".parse().unwrap(), &"1.0.0".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Registry { code: ErrorCode::Unauthorized, .. }));
    }
}

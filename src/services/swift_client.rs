//! Object store adapter speaking the Swift HTTP API.

use crate::services::object_store::{
    AccountInfo, ByteStream, ContainerInfo, ETAG_HEADER, ObjectBody, ObjectHeaders, ObjectInfo,
    ObjectStore, StoreError, StoreResult,
};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Body, Client, Method, RequestBuilder, Response, StatusCode, Url, header::HeaderMap};
use std::io;
use tracing::debug;

const AUTH_TOKEN_HEADER: &str = "x-auth-token";

/// Swift client bound to one account's storage URL.
#[derive(Clone, Debug)]
pub struct SwiftClient {
    http: Client,
    storage_url: String,
    base: Url,
    token: Option<String>,
}

impl SwiftClient {
    /// `storage_url` is the account URL, e.g. `http://swift:8080/v1/AUTH_tenant`.
    pub fn new(storage_url: impl Into<String>, token: Option<String>) -> StoreResult<Self> {
        let http = Client::builder().build()?;
        Self::with_client(http, storage_url, token)
    }

    pub fn with_client(
        http: Client,
        storage_url: impl Into<String>,
        token: Option<String>,
    ) -> StoreResult<Self> {
        let storage_url = storage_url.into().trim_end_matches('/').to_string();
        let base = Url::parse(&storage_url)
            .map_err(|err| StoreError::InvalidUrl(format!("{storage_url}: {err}")))?;
        if base.cannot_be_a_base() {
            return Err(StoreError::InvalidUrl(format!(
                "{storage_url}: not a hierarchical URL"
            )));
        }
        Ok(Self {
            http,
            storage_url,
            base,
            token,
        })
    }

    /// Account URL with `segments` appended, each percent-encoded as one
    /// path segment.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn container_url(&self, container: &str) -> Url {
        self.url(&[container])
    }

    fn object_url(&self, container: &str, object: &str) -> Url {
        self.url(&[container, object])
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.token {
            Some(token) => builder.header(AUTH_TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Send a request and map error statuses onto store error kinds.
    async fn send(
        &self,
        builder: RequestBuilder,
        container: &str,
        object: Option<&str>,
    ) -> StoreResult<Response> {
        let response = builder.send().await?;
        let status = response.status();
        debug!("swift {} -> {}", response.url(), status);
        if status.is_success() {
            return Ok(response);
        }
        Err(match status {
            StatusCode::NOT_FOUND => match object {
                Some(object) => StoreError::ObjectNotFound {
                    container: container.to_string(),
                    object: object.to_string(),
                },
                None => StoreError::ContainerNotFound(container.to_string()),
            },
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                StoreError::Unauthorized(format!("{} returned {}", response.url(), status))
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                StoreError::ServerIntegrity(object.unwrap_or(container).to_string())
            }
            _ => StoreError::Transport(format!("{} returned {}", response.url(), status)),
        })
    }
}

/// Lowercase header names with their values; non-UTF-8 values are skipped.
fn collect_headers(headers: &HeaderMap) -> ObjectHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
        })
        .collect()
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStore for SwiftClient {
    fn storage_url(&self) -> &str {
        &self.storage_url
    }

    async fn get_account(&self) -> StoreResult<AccountInfo> {
        let request = self.request(Method::HEAD, self.base.clone());
        let response = self.send(request, "", None).await?;
        let headers = response.headers();
        Ok(AccountInfo {
            container_count: header_u64(headers, "x-account-container-count"),
            object_count: header_u64(headers, "x-account-object-count"),
            bytes_used: header_u64(headers, "x-account-bytes-used"),
        })
    }

    async fn head_container(&self, container: &str) -> StoreResult<ContainerInfo> {
        let request = self.request(Method::HEAD, self.container_url(container));
        let response = self.send(request, container, None).await?;
        let headers = response.headers();
        Ok(ContainerInfo {
            name: container.to_string(),
            object_count: header_u64(headers, "x-container-object-count"),
            bytes_used: header_u64(headers, "x-container-bytes-used"),
        })
    }

    async fn put_container(&self, container: &str) -> StoreResult<()> {
        let request = self.request(Method::PUT, self.container_url(container));
        self.send(request, container, None).await?;
        Ok(())
    }

    async fn put_object(
        &self,
        container: &str,
        name: &str,
        body: ObjectBody,
        headers: ObjectHeaders,
    ) -> StoreResult<String> {
        let mut request = self.request(Method::PUT, self.object_url(container, name));
        for (header, value) in &headers {
            request = request.header(header.as_str(), value.as_str());
        }
        request = match body {
            ObjectBody::Bytes(bytes) => request.body(bytes),
            ObjectBody::Stream(stream) => request.body(Body::wrap_stream(stream)),
        };

        let response = self.send(request, container, Some(name)).await?;
        response
            .headers()
            .get(ETAG_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| StoreError::Transport(format!("PUT {container}/{name} returned no etag")))
    }

    async fn head_object(&self, container: &str, name: &str) -> StoreResult<ObjectInfo> {
        let request = self.request(Method::HEAD, self.object_url(container, name));
        let response = self.send(request, container, Some(name)).await?;
        let headers = collect_headers(response.headers());
        Ok(ObjectInfo {
            etag: headers.get(ETAG_HEADER).cloned().unwrap_or_default(),
            content_length: header_u64(response.headers(), "content-length"),
            headers,
        })
    }

    async fn get_object(&self, container: &str, name: &str) -> StoreResult<ByteStream> {
        let request = self.request(Method::GET, self.object_url(container, name));
        let response = self.send(request, container, Some(name)).await?;
        Ok(response.bytes_stream().map_err(io::Error::other).boxed())
    }
}

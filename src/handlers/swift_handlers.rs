//! HTTP handlers for the Swift-compatible account, container and object API.
//! Object bodies are streamed in both directions; storage concerns are
//! delegated to `LocalObjectStore`.

use crate::{
    errors::AppError,
    handlers::ServerState,
    services::object_store::{
        CONTENT_TYPE_HEADER, ETAG_HEADER, MANIFEST_HEADER, META_HEADER_PREFIX, ObjectHeaders,
        ObjectInfo, ObjectStore,
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use std::io;

/// `PUT /v1/{account}/{container}/{*object}`: upload an object.
///
/// An `ETag` request header makes the upload fail with 422 when the body
/// digest differs; `X-Object-Manifest` turns the object into a manifest.
pub async fn put_object(
    State(state): State<ServerState>,
    Path((_account, container, object)): Path<(String, String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    state.authorize(&headers)?;

    let object_headers = object_headers_from_request(&headers);
    let stream = body.into_data_stream().map_err(io::Error::other);
    let stored = state
        .store
        .upload_object_stream(&container, &object, &object_headers, stream)
        .await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::CREATED;
    if let Ok(value) = HeaderValue::from_str(&stored.etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

/// `HEAD /v1/{account}/{container}/{*object}`: object headers only.
pub async fn head_object(
    State(state): State<ServerState>,
    Path((_account, container, object)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    state.authorize(&headers)?;
    let info = state.store.head_object(&container, &object).await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &info, true);
    Ok(response)
}

/// `GET /v1/{account}/{container}/{*object}`: stream an object. Manifests
/// stream the concatenation of their segments.
pub async fn get_object(
    State(state): State<ServerState>,
    Path((_account, container, object)): Path<(String, String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    state.authorize(&headers)?;
    let info = state.store.head_object(&container, &object).await?;
    let stream = state.store.get_object(&container, &object).await?;

    let mut response = Response::new(Body::from_stream(stream));
    // Segment sizes may change between HEAD and GET; manifests go chunked.
    set_object_headers(response.headers_mut(), &info, info.manifest().is_none());
    Ok(response)
}

/// `PUT /v1/{account}/{container}`: 201 when created, 202 when it existed.
pub async fn put_container(
    State(state): State<ServerState>,
    Path((_account, container)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    state.authorize(&headers)?;
    if state.store.create_container(&container).await? {
        Ok(StatusCode::CREATED)
    } else {
        Ok(StatusCode::ACCEPTED)
    }
}

/// `HEAD /v1/{account}/{container}`
pub async fn head_container(
    State(state): State<ServerState>,
    Path((_account, container)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    state.authorize(&headers)?;
    let info = state.store.head_container(&container).await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let out = response.headers_mut();
    insert_count(out, "x-container-object-count", info.object_count);
    insert_count(out, "x-container-bytes-used", info.bytes_used);
    Ok(response)
}

/// `HEAD /v1/{account}`
pub async fn head_account(
    State(state): State<ServerState>,
    Path(_account): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    state.authorize(&headers)?;
    let info = state.store.get_account().await?;

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let out = response.headers_mut();
    insert_count(out, "x-account-container-count", info.container_count);
    insert_count(out, "x-account-object-count", info.object_count);
    insert_count(out, "x-account-bytes-used", info.bytes_used);
    Ok(response)
}

/// `GET /v1/{account}`: account usage as JSON.
pub async fn get_account(
    State(state): State<ServerState>,
    Path(_account): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    state.authorize(&headers)?;
    let info = state.store.get_account().await?;
    Ok(Json(info))
}

/// Request headers the store keeps: content type, manifest, ETag check and
/// user metadata.
fn object_headers_from_request(headers: &HeaderMap) -> ObjectHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str();
            let kept = name == CONTENT_TYPE_HEADER
                || name == MANIFEST_HEADER
                || name == ETAG_HEADER
                || name.starts_with(META_HEADER_PREFIX);
            if !kept {
                return None;
            }
            value
                .to_str()
                .ok()
                .map(|value| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn set_object_headers(out: &mut HeaderMap, info: &ObjectInfo, with_length: bool) {
    for (name, value) in &info.headers {
        let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            continue;
        };
        out.insert(name, value);
    }
    if !out.contains_key(header::CONTENT_TYPE) {
        out.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
    }
    if with_length {
        out.insert(header::CONTENT_LENGTH, HeaderValue::from(info.content_length));
    }
}

fn insert_count(out: &mut HeaderMap, name: &'static str, value: u64) {
    out.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_only_store_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-object-manifest", HeaderValue::from_static("c/p_"));
        headers.insert("x-object-meta-lsn", HeaderValue::from_static("42"));
        headers.insert("etag", HeaderValue::from_static("abc"));
        headers.insert("x-auth-token", HeaderValue::from_static("secret"));
        headers.insert("user-agent", HeaderValue::from_static("test"));

        let kept = object_headers_from_request(&headers);
        assert_eq!(kept.len(), 3);
        assert_eq!(kept["x-object-manifest"], "c/p_");
        assert_eq!(kept["x-object-meta-lsn"], "42");
        assert!(!kept.contains_key("x-auth-token"));
    }

    #[test]
    fn object_headers_default_content_type() {
        let mut info = ObjectInfo {
            etag: "\"abc\"".into(),
            content_length: 12,
            ..Default::default()
        };
        info.headers.insert("etag".into(), "\"abc\"".into());

        let mut out = HeaderMap::new();
        set_object_headers(&mut out, &info, true);
        assert_eq!(out[header::ETAG], "\"abc\"");
        assert_eq!(out[header::CONTENT_LENGTH], "12");
        assert_eq!(out[header::CONTENT_TYPE], "application/octet-stream");
    }
}

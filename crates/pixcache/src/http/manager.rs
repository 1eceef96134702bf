//! Generic HTTP API on top of [`HttpExecutor`].

use std::collections::BTreeMap;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;

use super::executor::{HttpExecutor, RequestHandle, RequestHooks};
use super::request::{HttpMethod, HttpRequestSpec, PostContentType};
use crate::error::{FetchError, Result};

pub type Params = BTreeMap<String, String>;

/// Convenience front end for GET/POST/PUT/DELETE/UPLOAD requests.
#[derive(Debug, Clone)]
pub struct HttpManager {
    executor: HttpExecutor,
}

impl HttpManager {
    pub fn new(executor: HttpExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &HttpExecutor {
        &self.executor
    }

    pub fn get(
        &self,
        url: &str,
        params: Params,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        self.submit(HttpMethod::Get, url, params, headers, hooks)
    }

    pub fn post(
        &self,
        url: &str,
        content_type: PostContentType,
        params: Params,
        body: Option<Bytes>,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        self.submit(
            HttpMethod::Post { content_type, body },
            url,
            params,
            headers,
            hooks,
        )
    }

    pub fn put(
        &self,
        url: &str,
        params: Params,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        self.submit(HttpMethod::Put, url, params, headers, hooks)
    }

    pub fn delete(
        &self,
        url: &str,
        params: Params,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        self.submit(HttpMethod::Delete, url, params, headers, hooks)
    }

    /// Multipart upload of `data` as the `file` part; params become text fields.
    pub fn upload(
        &self,
        url: &str,
        file_name: impl Into<String>,
        data: Bytes,
        params: Params,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        let method = HttpMethod::Upload {
            file_name: file_name.into(),
            data,
        };
        self.submit(method, url, params, headers, hooks)
    }

    /// GET `url` and decode the JSON body, or its `data_key` member, into `T`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        params: Params,
        data_key: Option<&str>,
    ) -> Result<T> {
        let spec = HttpRequestSpec::get(url)?.with_params(params);
        let response = self.executor.execute_async(spec, RequestHooks::new()).await?;
        decode_json(&response.body, data_key)
    }

    fn submit(
        &self,
        method: HttpMethod,
        url: &str,
        params: Params,
        headers: HeaderMap,
        hooks: RequestHooks,
    ) -> Result<RequestHandle> {
        let spec = HttpRequestSpec::new(method, url::Url::parse(url)?)
            .with_params(params)
            .with_headers(headers);
        Ok(self.executor.execute(spec, hooks))
    }
}

/// Decode `body` as JSON into `T`. With `data_key`, the body must be an object and
/// only that member is decoded.
pub fn decode_json<T: DeserializeOwned>(body: &[u8], data_key: Option<&str>) -> Result<T> {
    let Some(key) = data_key else {
        return Ok(serde_json::from_slice(body)?);
    };

    let mut value: serde_json::Value = serde_json::from_slice(body)?;
    let member = value
        .get_mut(key)
        .map(serde_json::Value::take)
        .ok_or_else(|| FetchError::Deserialization(format!("missing key '{key}' in response")))?;
    Ok(serde_json::from_value(member)?)
}

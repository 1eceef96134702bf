use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::{FetchError, Result};

/// Body encoding for POST requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostContentType {
    #[default]
    FormUrlEncoded,
    TextPlain,
}

impl PostContentType {
    pub fn mime(&self) -> &'static str {
        match self {
            PostContentType::FormUrlEncoded => "application/x-www-form-urlencoded",
            PostContentType::TextPlain => "text/plain",
        }
    }
}

/// Request kind, with the payload that belongs to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    /// `body` replaces the form-encoded params when present
    Post {
        content_type: PostContentType,
        body: Option<Bytes>,
    },
    Put,
    Delete,
    /// Multipart upload: params become text fields, `data` the file part
    Upload { file_name: String, data: Bytes },
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post { .. } => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Upload { .. } => "UPLOAD",
        }
    }

    /// Whether params are serialized into the query string.
    pub fn params_in_url(&self) -> bool {
        matches!(self, HttpMethod::Get | HttpMethod::Put | HttpMethod::Delete)
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable description of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec {
    pub method: HttpMethod,
    pub url: Url,
    pub params: BTreeMap<String, String>,
    pub headers: HeaderMap,
    /// Persist a successful response in the response cache even without an `on_cached` hook
    pub store_response: bool,
}

impl HttpRequestSpec {
    pub fn new(method: HttpMethod, url: Url) -> Self {
        Self {
            method,
            url,
            params: BTreeMap::new(),
            headers: HeaderMap::new(),
            store_response: false,
        }
    }

    pub fn get(url: &str) -> Result<Self> {
        Ok(Self::new(HttpMethod::Get, Url::parse(url)?))
    }

    pub fn post(url: &str, content_type: PostContentType, body: Option<Bytes>) -> Result<Self> {
        Ok(Self::new(
            HttpMethod::Post { content_type, body },
            Url::parse(url)?,
        ))
    }

    pub fn put(url: &str) -> Result<Self> {
        Ok(Self::new(HttpMethod::Put, Url::parse(url)?))
    }

    pub fn delete(url: &str) -> Result<Self> {
        Ok(Self::new(HttpMethod::Delete, Url::parse(url)?))
    }

    pub fn upload(url: &str, file_name: impl Into<String>, data: Bytes) -> Result<Self> {
        Ok(Self::new(
            HttpMethod::Upload {
                file_name: file_name.into(),
                data,
            },
            Url::parse(url)?,
        ))
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params<I, K, V>(mut self, params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.params
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let name = name
            .parse::<HeaderName>()
            .map_err(|e| FetchError::Config(format!("invalid header name '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::Config(format!("invalid header value: {e}")))?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn store_response(mut self, store: bool) -> Self {
        self.store_response = store;
        self
    }

    /// The URL actually requested: params appended to the query for GET/PUT/DELETE.
    pub fn request_url(&self) -> Url {
        let mut url = self.url.clone();
        if self.method.params_in_url() && !self.params.is_empty() {
            url.query_pairs_mut().extend_pairs(self.params.iter());
        }
        url
    }

    /// Form-encoded params, used as the POST body when none is given.
    pub fn encoded_params(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }

    /// Response cache key: the URL with every param (query or explicit) sorted into
    /// the query string. Two specs that differ only in param order share a key.
    pub fn canonical_key(&self) -> String {
        let mut url = self.url.clone();
        url.set_fragment(None);

        let mut pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        pairs.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs.sort();

        if pairs.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(pairs);
        }
        url.to_string()
    }
}

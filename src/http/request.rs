use std::collections::HashMap;

use reqwest::Method;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// One REST route: the concrete path plus the rate-limit identity it is
/// billed under. Routes sharing a template and major parameter share a
/// bucket; the server may later coalesce several routes under one bucket
/// id via response headers.
#[derive(Debug, Clone)]
pub struct Route {
    pub method: Method,
    /// Path template with placeholders left in, e.g.
    /// `/api/v1/channels/{channel_id}/messages`.
    pub template: &'static str,
    /// Concrete request path.
    pub path: String,
    /// Major parameter scoping the bucket (channel id, space id).
    pub major: Option<String>,
    /// Whether the route counts against the global limit.
    pub global: bool,
}

impl Route {
    pub fn new(method: Method, template: &'static str, path: impl Into<String>) -> Self {
        Self {
            method,
            template,
            path: path.into(),
            major: None,
            global: true,
        }
    }

    pub fn with_major(mut self, major: impl Into<String>) -> Self {
        self.major = Some(major.into());
        self
    }

    /// Composite key identifying this route's own bucket.
    pub fn bucket_key(&self) -> String {
        match &self.major {
            Some(major) => format!("{} {} {major}", self.method, self.template),
            None => format!("{} {}", self.method, self.template),
        }
    }

    // The full route catalog lives with callers; these cover the routes
    // the client itself needs plus the common message paths.

    pub fn gateway() -> Self {
        Self::new(Method::GET, "/api/v1/gateway", "/api/v1/gateway")
    }

    pub fn create_message(channel_id: &str) -> Self {
        Self::new(
            Method::POST,
            "/api/v1/channels/{channel_id}/messages",
            format!("/api/v1/channels/{channel_id}/messages"),
        )
        .with_major(channel_id)
    }

    pub fn get_channel(channel_id: &str) -> Self {
        Self::new(
            Method::GET,
            "/api/v1/channels/{channel_id}",
            format!("/api/v1/channels/{channel_id}"),
        )
        .with_major(channel_id)
    }
}

/// An outbound REST request as callers submit it.
#[derive(Debug, Clone)]
pub struct RestRequest {
    pub route: Route,
    pub body: Option<serde_json::Value>,
}

impl RestRequest {
    pub fn new(route: Route) -> Self {
        Self { route, body: None }
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// A response with headers kept around for bucket extraction.
#[derive(Debug, Clone)]
pub struct RestResponse {
    pub status: u16,
    /// Header names lowercased; lookup through `header_value`.
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RestResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

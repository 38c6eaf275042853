use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::backend::NetworkBackend;
use warden_core::{HttpMethod, HttpRequest, HttpResponse, Result};

/// Network capability bound to one plugin. Every verb funnels through the
/// same backend `request` command.
#[derive(Clone)]
pub struct NetworkApi {
    plugin_id: String,
    backend: Arc<dyn NetworkBackend>,
}

impl NetworkApi {
    pub fn new(plugin_id: impl Into<String>, backend: Arc<dyn NetworkBackend>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            backend,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub async fn request(&self, request: HttpRequest) -> Result<HttpResponse> {
        debug!(
            plugin_id = %self.plugin_id,
            method = %request.method,
            url = %request.url,
            "http.request"
        );
        self.backend.request(&self.plugin_id, request).await
    }

    pub async fn get(&self, url: &str, headers: BTreeMap<String, String>) -> Result<HttpResponse> {
        self.request(HttpRequest::new(HttpMethod::Get, url).with_headers(headers))
            .await
    }

    pub async fn post(
        &self,
        url: &str,
        body: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.request(with_body(HttpMethod::Post, url, body, headers))
            .await
    }

    pub async fn put(
        &self,
        url: &str,
        body: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.request(with_body(HttpMethod::Put, url, body, headers))
            .await
    }

    pub async fn delete(
        &self,
        url: &str,
        headers: BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.request(HttpRequest::new(HttpMethod::Delete, url).with_headers(headers))
            .await
    }

    pub async fn patch(
        &self,
        url: &str,
        body: Option<String>,
        headers: BTreeMap<String, String>,
    ) -> Result<HttpResponse> {
        self.request(with_body(HttpMethod::Patch, url, body, headers))
            .await
    }
}

fn with_body(
    method: HttpMethod,
    url: &str,
    body: Option<String>,
    headers: BTreeMap<String, String>,
) -> HttpRequest {
    HttpRequest {
        body,
        ..HttpRequest::new(method, url).with_headers(headers)
    }
}

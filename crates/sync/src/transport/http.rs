// HTTP transport for the cloud session store (REST over reqwest).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tether_common::protocol::api::{
    CreateSessionRequest, ForkSessionRequest, ForkSessionResponse, ShareSessionRequest,
    ShareSessionResponse, TokenCheckResponse, UpdateSessionRequest, UploadBlobResponse,
    CURRENT_API_VERSION,
};
use tether_common::types::{BlobKind, RemoteSession, Visibility};
use tracing::debug;
use url::Url;

use super::{SessionTransport, TransportError, TransportFuture};
use crate::security::CredentialSource;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY_CHARS: usize = 512;

pub struct HttpSessionTransport {
    client: Client,
    base_url: Url,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpSessionTransport {
    pub fn new(api_url: &str, credentials: Arc<dyn CredentialSource>) -> Result<Self> {
        let base_url = validate_api_url(api_url)?;
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build session store HTTP client")?;
        Ok(Self { client, base_url, credentials })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        endpoint_url(&self.base_url, segments)
    }

    fn authorized(&self, builder: RequestBuilder) -> Result<RequestBuilder, TransportError> {
        let token = self
            .credentials
            .get_token()
            .ok_or_else(|| TransportError::Unauthorized("no credential available".into()))?;
        Ok(builder.bearer_auth(token))
    }

    fn json_call<T>(
        &self,
        build: impl FnOnce(&Client) -> Result<RequestBuilder, TransportError>,
    ) -> TransportFuture<'_, T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let request = build(&self.client).and_then(|builder| self.authorized(builder));
        Box::pin(async move { send_json(request?).await })
    }
}

impl SessionTransport for HttpSessionTransport {
    fn create(&self, request: CreateSessionRequest) -> TransportFuture<'_, RemoteSession> {
        let url = self.endpoint(&["sessions"]);
        self.json_call(move |client| Ok(client.post(url?).json(&request)))
    }

    fn get(&self, session_id: &str, include_blob_urls: bool) -> TransportFuture<'_, RemoteSession> {
        let url = self.endpoint(&["sessions", session_id]);
        self.json_call(move |client| {
            let mut url = url?;
            url.query_pairs_mut()
                .append_pair("include_blob_urls", if include_blob_urls { "true" } else { "false" });
            Ok(client.get(url))
        })
    }

    fn update(
        &self,
        session_id: &str,
        request: UpdateSessionRequest,
    ) -> TransportFuture<'_, RemoteSession> {
        let url = self.endpoint(&["sessions", session_id]);
        self.json_call(move |client| Ok(client.patch(url?).json(&request)))
    }

    fn share(
        &self,
        session_id: &str,
        visibility: Visibility,
    ) -> TransportFuture<'_, ShareSessionResponse> {
        let url = self.endpoint(&["sessions", session_id, "share"]);
        let body = ShareSessionRequest { visibility };
        self.json_call(move |client| Ok(client.post(url?).json(&body)))
    }

    fn fork(&self, request: ForkSessionRequest) -> TransportFuture<'_, ForkSessionResponse> {
        let url = self.endpoint(&["sessions", "fork"]);
        self.json_call(move |client| Ok(client.post(url?).json(&request)))
    }

    fn upload_blob(
        &self,
        session_id: &str,
        kind: BlobKind,
        content: Vec<u8>,
    ) -> TransportFuture<'_, UploadBlobResponse> {
        let url = self.endpoint(&["sessions", session_id, "blobs", kind.as_str()]);
        debug!(session_id, kind = %kind, bytes = content.len(), "uploading blob");
        self.json_call(move |client| {
            Ok(client
                .put(url?)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(content))
        })
    }

    fn fetch_blob(&self, url: &str) -> TransportFuture<'_, Vec<u8>> {
        let parsed = Url::parse(url)
            .map_err(|error| TransportError::Decode(format!("invalid blob url `{url}`: {error}")));
        let client = self.client.clone();
        Box::pin(async move {
            let response = client.get(parsed?).send().await.map_err(map_reqwest_error)?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(map_status(status, &body));
            }
            let bytes = response.bytes().await.map_err(map_reqwest_error)?;
            Ok(bytes.to_vec())
        })
    }

    fn token_valid(&self) -> TransportFuture<'_, bool> {
        let url = self.endpoint(&["auth", "token"]);
        let request = url.map(|url| self.client.get(url)).and_then(|b| self.authorized(b));
        Box::pin(async move {
            match send_json::<TokenCheckResponse>(request?).await {
                Ok(response) => Ok(response.valid),
                Err(TransportError::Unauthorized(_)) => Ok(false),
                Err(error) => Err(error),
            }
        })
    }
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, TransportError> {
    let response = request.send().await.map_err(map_reqwest_error)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(map_status(status, &body));
    }
    response.json::<T>().await.map_err(|error| TransportError::Decode(error.to_string()))
}

fn map_reqwest_error(error: reqwest::Error) -> TransportError {
    match error.status() {
        Some(status) => map_status(status, &error.to_string()),
        None => TransportError::Network(error.to_string()),
    }
}

fn map_status(status: StatusCode, body: &str) -> TransportError {
    let message: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::Unauthorized(message),
        StatusCode::NOT_FOUND => TransportError::NotFound(message),
        _ => TransportError::Server { status: status.as_u16(), message },
    }
}

fn endpoint_url(base: &Url, segments: &[&str]) -> Result<Url, TransportError> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|()| TransportError::Network(format!("api url `{base}` cannot be a base")))?
        .pop_if_empty()
        .push(CURRENT_API_VERSION)
        .extend(segments);
    Ok(url)
}

fn validate_api_url(value: &str) -> Result<Url> {
    let parsed = Url::parse(value).map_err(|error| anyhow!("invalid api_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "https" => Ok(parsed),
        "http" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("api_url must use https (http is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}

//! Internal HTTP client that handles authentication and automatic ticket refresh.

use crate::{
    ClientConfig, PlatformAuth, PlatformConnection, PveKubeError, PveKubeResult,
    auth::application::service::login_service::LoginService,
    core::domain::{error::ValidationError, model::vm::ApiEnvelope},
};
use governor::{DefaultDirectRateLimiter, Quota};
use reqwest::{
    Client, Method, Response, StatusCode,
    multipart::{Form, Part},
};
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, trace};

/// Request payloads the API client knows how to send.
enum Payload<'a> {
    Empty,
    Json(serde_json::Value),
    Upload {
        content_kind: &'a str,
        file_name: &'a str,
        bytes: &'a [u8],
    },
}

/// HTTP client for the platform API.
///
/// Adds `PVEAuthCookie` and `CSRFPreventionToken` to every request and
/// unwraps the `{"data": ...}` envelope. A `401 Unauthorized` triggers one
/// fresh login followed by a single retry.
#[derive(Debug)]
pub struct ApiClient {
    http_client: Client,
    connection: Arc<PlatformConnection>,
    auth: Arc<RwLock<Option<PlatformAuth>>>,
    config: Arc<ClientConfig>,
    rate_limiter: Option<Arc<DefaultDirectRateLimiter>>,
}

impl ApiClient {
    /// Creates a new `ApiClient`. The client starts unauthenticated.
    ///
    /// # Errors
    /// Returns `PveKubeError::Connection` if the HTTP client cannot be built and
    /// `PveKubeError::Validation` for a zero rate limit.
    pub fn new(connection: PlatformConnection, config: ClientConfig) -> PveKubeResult<Self> {
        let http_client = Client::builder()
            .danger_accept_invalid_certs(connection.accepts_invalid_certs())
            .build()
            .map_err(|e| PveKubeError::Connection(e.to_string()))?;

        let rate_limiter = match config.rate_limit {
            Some(rl) => {
                let per_second = NonZeroU32::new(rl.requests_per_second).ok_or_else(|| {
                    ValidationError::field("requests_per_second", "must be greater than 0")
                })?;
                let burst = NonZeroU32::new(rl.burst_size)
                    .ok_or_else(|| ValidationError::field("burst_size", "must be greater than 0"))?;
                let quota = Quota::per_second(per_second).allow_burst(burst);
                Some(Arc::new(DefaultDirectRateLimiter::direct(quota)))
            }
            None => None,
        };

        Ok(Self {
            http_client,
            connection: Arc::new(connection),
            auth: Arc::new(RwLock::new(None)),
            config: Arc::new(config),
            rate_limiter,
        })
    }

    pub fn connection(&self) -> &PlatformConnection {
        &self.connection
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Sets the authentication state (used after a successful login or session restore).
    pub async fn set_auth(&self, auth: PlatformAuth) {
        *self.auth.write().await = Some(auth);
    }

    pub async fn auth(&self) -> Option<PlatformAuth> {
        self.auth.read().await.clone()
    }

    /// Returns `true` if there is a valid (non-expired) ticket.
    pub async fn is_authenticated(&self) -> bool {
        self.auth
            .read()
            .await
            .as_ref()
            .is_some_and(|a| !a.ticket().is_expired(self.config.ticket_lifetime))
    }

    /// Logs in with the stored credentials, replacing any current session.
    pub async fn login(&self) -> PveKubeResult<()> {
        self.refresh_auth().await
    }

    pub async fn get<T>(&self, path: &str) -> PveKubeResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.execute_request(Method::GET, path, Payload::Empty).await
    }

    pub async fn post<B, T>(&self, path: &str, body: &B) -> PveKubeResult<T>
    where
        B: serde::Serialize,
        T: serde::de::DeserializeOwned,
    {
        let body = serde_json::to_value(body)?;
        self.execute_request(Method::POST, path, Payload::Json(body))
            .await
    }

    pub async fn delete<T>(&self, path: &str) -> PveKubeResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.execute_request(Method::DELETE, path, Payload::Empty)
            .await
    }

    /// Uploads a file as `multipart/form-data` with `content` and `filename` parts.
    pub async fn upload<T>(
        &self,
        path: &str,
        content_kind: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> PveKubeResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let payload = Payload::Upload {
            content_kind,
            file_name,
            bytes,
        };
        self.execute_request(Method::POST, path, payload).await
    }

    async fn execute_request<T>(
        &self,
        method: Method,
        path: &str,
        payload: Payload<'_>,
    ) -> PveKubeResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.ensure_authenticated().await?;

        let mut response = self.send(method.clone(), path, &payload).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            debug!(path, "session rejected, logging in again");
            self.refresh_auth().await?;
            response = self.send(method, path, &payload).await?;
        }

        Self::decode(path, response).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        payload: &Payload<'_>,
    ) -> PveKubeResult<Response> {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let url = self.connection.url().api(path);
        trace!(%method, %url, "platform request");
        let mut builder = self.http_client.request(method, &url);

        if let Some(auth) = self.auth.read().await.as_ref() {
            builder = builder.header("Cookie", auth.ticket().as_cookie_header());
            if let Some(csrf) = auth.csrf_token() {
                builder = builder.header("CSRFPreventionToken", csrf.as_str());
            }
        }

        builder = match payload {
            Payload::Empty => builder,
            Payload::Json(body) => builder.json(body),
            Payload::Upload {
                content_kind,
                file_name,
                bytes,
            } => {
                let form = Form::new().text("content", content_kind.to_string()).part(
                    "filename",
                    Part::bytes(bytes.to_vec()).file_name(file_name.to_string()),
                );
                builder.multipart(form)
            }
        };

        builder
            .send()
            .await
            .map_err(|e| PveKubeError::Connection(format!("HTTP request failed: {e}")))
    }

    async fn decode<T>(path: &str, response: Response) -> PveKubeResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(PveKubeError::Authentication(format!(
                "request to {path} rejected after re-login"
            )));
        }
        if !status.is_success() {
            let text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            return Err(PveKubeError::Platform(format!(
                "API error on {path} ({status}): {text}"
            )));
        }

        response
            .json::<ApiEnvelope<T>>()
            .await
            .map(|envelope| envelope.data)
            .map_err(|e| PveKubeError::Data(format!("Failed to parse response from {path}: {e}")))
    }

    async fn ensure_authenticated(&self) -> PveKubeResult<()> {
        if !self.is_authenticated().await {
            self.refresh_auth().await?;
        }
        Ok(())
    }

    async fn refresh_auth(&self) -> PveKubeResult<()> {
        let auth = LoginService::new()
            .execute(&self.http_client, &self.connection)
            .await?;
        self.set_auth(auth).await;
        Ok(())
    }
}

use crate::{
    PlatformAuth, PlatformConnection, PveKubeError, PveKubeResult,
    auth::application::{
        request::login_request::LoginRequest, response::login_response::LoginResponse,
    },
    core::domain::{
        error::ValidationError,
        value_object::{CsrfToken, SessionTicket},
    },
};
use reqwest::{
    Client, StatusCode,
    header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue},
};
use tracing::{debug, instrument};

/// Exchanges username and password for a session ticket.
pub struct LoginService {
    default_headers: HeaderMap,
}

impl LoginService {
    pub fn new() -> Self {
        let mut default_headers = HeaderMap::new();
        default_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        Self { default_headers }
    }

    #[instrument(skip_all, fields(host = %connection.host(), user = connection.username().as_str()))]
    pub async fn execute(
        &self,
        http_client: &Client,
        connection: &PlatformConnection,
    ) -> PveKubeResult<PlatformAuth> {
        let request = LoginRequest {
            username: connection.username().as_str().to_string(),
            password: connection.password().as_str().to_string(),
            realm: connection.realm().as_str().to_string(),
        };
        let response = http_client
            .post(connection.url().api("access/ticket"))
            .headers(self.default_headers.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| PveKubeError::Connection(e.to_string()))?;

        match response.status() {
            StatusCode::OK => self.handle_successful_login(response).await,
            StatusCode::UNAUTHORIZED => Err(PveKubeError::Authentication(
                "Invalid credentials provided".to_string(),
            )),
            StatusCode::BAD_REQUEST => Err(ValidationError::Field {
                field: "request".to_string(),
                message: "Invalid request format".to_string(),
            }
            .into()),
            StatusCode::NOT_FOUND => Err(PveKubeError::Connection(
                "Login endpoint not found".to_string(),
            )),
            StatusCode::SERVICE_UNAVAILABLE => Err(PveKubeError::Connection(
                "Platform API is currently unavailable".to_string(),
            )),
            status => Err(PveKubeError::Connection(format!(
                "Unexpected response status: {status}"
            ))),
        }
    }

    async fn handle_successful_login(
        &self,
        response: reqwest::Response,
    ) -> PveKubeResult<PlatformAuth> {
        let login = response.json::<LoginResponse>().await.map_err(|e| {
            PveKubeError::Connection(format!("Failed to parse login response: {e}"))
        })?;

        let ticket = SessionTicket::new(login.data.ticket)?;
        let csrf_token = CsrfToken::new(login.data.csrf_token)?;
        debug!(
            user = login.data.username.as_deref().unwrap_or("unknown"),
            "platform session established"
        );

        Ok(PlatformAuth::new(ticket, Some(csrf_token)))
    }
}

impl Default for LoginService {
    fn default() -> Self {
        Self::new()
    }
}

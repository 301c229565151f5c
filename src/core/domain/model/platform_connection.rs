use crate::core::domain::{
    error::PveKubeResult,
    model::cluster_request::{PlatformCredentials, PlatformEndpoint},
    value_object::{
        PlatformHost, PlatformPassword, PlatformPort, PlatformRealm, PlatformUrl, PlatformUsername,
    },
};

/// Validated connection parameters for the platform API.
#[derive(Debug, Clone)]
pub struct PlatformConnection {
    host: PlatformHost,
    port: PlatformPort,
    username: PlatformUsername,
    password: PlatformPassword,
    realm: PlatformRealm,
    accept_invalid_certs: bool,
    url: PlatformUrl,
}

impl PlatformConnection {
    pub fn new(
        host: PlatformHost,
        port: PlatformPort,
        username: PlatformUsername,
        password: PlatformPassword,
        realm: PlatformRealm,
        secure: bool,
        accept_invalid_certs: bool,
    ) -> PveKubeResult<Self> {
        let url = PlatformUrl::from_parts(&host, port, secure)?;
        Ok(Self::with_url(
            host,
            port,
            username,
            password,
            realm,
            accept_invalid_certs,
            url,
        ))
    }

    /// Builds a connection against an explicit base URL.
    pub fn with_url(
        host: PlatformHost,
        port: PlatformPort,
        username: PlatformUsername,
        password: PlatformPassword,
        realm: PlatformRealm,
        accept_invalid_certs: bool,
        url: PlatformUrl,
    ) -> Self {
        Self {
            host,
            port,
            username,
            password,
            realm,
            accept_invalid_certs,
            url,
        }
    }

    /// Validates the persisted endpoint and credentials; always HTTPS.
    pub fn from_settings(
        endpoint: &PlatformEndpoint,
        credentials: &PlatformCredentials,
        min_password_score: Option<zxcvbn::Score>,
    ) -> PveKubeResult<Self> {
        Self::new(
            PlatformHost::new(endpoint.host.clone())?,
            PlatformPort::new(endpoint.port)?,
            PlatformUsername::new(credentials.username.clone())?,
            PlatformPassword::new(credentials.password.clone(), min_password_score)?,
            PlatformRealm::new(credentials.realm.clone())?,
            true,
            endpoint.accept_invalid_certs,
        )
    }

    pub fn host(&self) -> &PlatformHost {
        &self.host
    }

    pub fn port(&self) -> PlatformPort {
        self.port
    }

    pub fn username(&self) -> &PlatformUsername {
        &self.username
    }

    pub fn password(&self) -> &PlatformPassword {
        &self.password
    }

    pub fn realm(&self) -> &PlatformRealm {
        &self.realm
    }

    pub fn accepts_invalid_certs(&self) -> bool {
        self.accept_invalid_certs
    }

    pub fn url(&self) -> &PlatformUrl {
        &self.url
    }
}

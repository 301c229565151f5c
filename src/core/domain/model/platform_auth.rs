use crate::core::domain::value_object::{CsrfToken, SessionTicket};

/// An authenticated platform session.
#[derive(Debug, Clone)]
pub struct PlatformAuth {
    ticket: SessionTicket,
    csrf_token: Option<CsrfToken>,
}

impl PlatformAuth {
    pub fn new(ticket: SessionTicket, csrf_token: Option<CsrfToken>) -> Self {
        Self { ticket, csrf_token }
    }

    pub fn ticket(&self) -> &SessionTicket {
        &self.ticket
    }

    pub fn csrf_token(&self) -> Option<&CsrfToken> {
        self.csrf_token.as_ref()
    }
}

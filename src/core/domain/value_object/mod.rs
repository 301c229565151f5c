mod credential;
mod endpoint;
mod join_token;
mod session;

pub mod serde_helpers;

pub use credential::{PlatformPassword, PlatformRealm, PlatformUsername};
pub use endpoint::{PlatformHost, PlatformPort, PlatformUrl};
pub use join_token::{JoinToken, is_ipv4};
pub use session::{CsrfToken, SessionTicket};

pub(crate) use credential::{validate_password, validate_realm, validate_username};
pub(crate) use endpoint::{validate_host, validate_port};
pub(crate) use session::{validate_csrf_token, validate_ticket};

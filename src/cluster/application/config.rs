use std::time::Duration;

/// Guest-side knobs for provisioning nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionConfig {
    /// How long a booted VM may take to report an address.
    pub address_timeout: Duration,
    /// Bound on the whole interactive password change.
    pub rotation_timeout: Duration,
    /// Bound on a single remote command; `None` waits forever.
    pub command_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    pub guest_user: String,
    /// Factory password the guest image ships with.
    pub default_password: String,
    /// Password the guest account is rotated to.
    pub guest_password: String,
    pub ssh_port: u16,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            address_timeout: Duration::from_secs(300),
            rotation_timeout: Duration::from_secs(60),
            command_timeout: None,
            connect_timeout: Duration::from_secs(30),
            guest_user: "root".to_string(),
            default_password: "changeme".to_string(),
            guest_password: "kubernetes".to_string(),
            ssh_port: 22,
        }
    }
}

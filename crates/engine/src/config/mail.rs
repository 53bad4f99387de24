//! Mail server settings carried by the engine configuration

/// Outgoing mail server
#[derive(Clone, PartialEq, Eq)]
pub struct MailServerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub use_tls: bool,
}

impl MailServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            use_ssl: false,
            use_tls: false,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl(mut self, use_ssl: bool) -> Self {
        self.use_ssl = use_ssl;
        self
    }

    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }
}

impl std::fmt::Debug for MailServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("use_ssl", &self.use_ssl)
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let mail = MailServerConfig::new("smtp.example.org", 587).with_credentials("ops", "hunter2");
        let printed = format!("{mail:?}");
        assert!(printed.contains("smtp.example.org"));
        assert!(!printed.contains("hunter2"));
    }
}

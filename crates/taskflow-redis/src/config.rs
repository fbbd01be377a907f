//! Redis connection settings.

use std::time::Duration;

/// Configuration for Redis connection.
#[derive(Debug, Clone)]
pub struct RedisConfig {
    /// Redis connection URL (e.g., "redis://127.0.0.1:6379/")
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Upper bound on establishing the initial connection.
    pub connection_timeout: Duration,
    /// Prepended to every key so several engines can share one database.
    pub key_prefix: String,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            password: None,
            connection_timeout: Duration::from_secs(5),
            key_prefix: "taskflow:".to_string(),
        }
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Build the connection URL, adding the scheme, credentials and trailing
    /// slash when they are missing.
    pub(crate) fn build_connection_url(&self) -> String {
        let (scheme, rest) = match self.url.split_once("://") {
            Some((scheme, rest)) => (scheme.to_string(), rest.to_string()),
            None => ("redis".to_string(), self.url.clone()),
        };
        let auth = match (&self.username, &self.password) {
            _ if rest.contains('@') => String::new(),
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        let mut url = format!("{scheme}://{auth}{rest}");
        if !url.ends_with('/') {
            url.push('/');
        }
        url
    }
}

use crate::ConfigError;
use serde::{
    Deserialize,
    Serialize,
};
use std::time::Duration;
use url::Url;

/// Where and how batches are delivered to the pattoo server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteApi {
    pub api_ip_address: String,
    pub api_ip_bind_port: u16,
    pub api_uses_https: bool,
    pub api_uri: String,
    /// Per request timeout in seconds.
    pub request_timeout: u64,
    /// Consecutive transient failures a single drain tolerates before yielding.
    pub retry_attempts: u32,
}

impl RemoteApi {
    pub(crate) fn normalize(mut self) -> Result<Self, ConfigError> {
        self.api_uri = self.api_uri.trim().trim_matches('/').to_string();
        self.api_ip_address = self.api_ip_address.trim().to_string();

        if self.api_ip_address.is_empty() {
            return Err(ConfigError::Invalid {
                section: "remote_api",
                key: "api_ip_address",
                reason: "must not be empty".to_string(),
            });
        }
        if self.api_ip_bind_port == 0 {
            return Err(ConfigError::Invalid {
                section: "remote_api",
                key: "api_ip_bind_port",
                reason: "must be a non-zero port".to_string(),
            });
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Invalid {
                section: "remote_api",
                key: "retry_attempts",
                reason: "must be at least 1".to_string(),
            });
        }

        // Catch hosts that can never form a URL before the scheduler starts.
        self.receive_url("validation")?;
        Ok(self)
    }

    pub fn scheme(&self) -> &'static str {
        if self.api_uses_https {
            "https"
        } else {
            "http"
        }
    }

    /// `{scheme}://{host}:{port}/{uri}/receive/{agent_id}`
    pub fn receive_url(&self, agent_id: &str) -> Result<Url, ConfigError> {
        let raw = if self.api_uri.is_empty() {
            format!(
                "{}://{}:{}/receive/{}",
                self.scheme(),
                self.api_ip_address,
                self.api_ip_bind_port,
                agent_id
            )
        } else {
            format!(
                "{}://{}:{}/{}/receive/{}",
                self.scheme(),
                self.api_ip_address,
                self.api_ip_bind_port,
                self.api_uri,
                agent_id
            )
        };
        Url::parse(&raw).map_err(|err| ConfigError::Invalid {
            section: "remote_api",
            key: "api_ip_address",
            reason: format!("{raw:?} is not a valid URL: {err}"),
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

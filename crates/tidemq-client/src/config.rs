//! Client configuration.

use std::time::Duration;

use tidemq_core::packet::{Message, VERSION_311};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Client identifier.
    pub client_id: String,
    /// Clean session flag.
    pub clean_session: bool,
    /// Keep-alive interval (zero disables keep-alive).
    pub keep_alive: Duration,
    /// MQTT protocol level (4 = 3.1.1, 3 = 3.1).
    pub version: u8,
    /// Username for authentication.
    pub username: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Last will and testament message.
    pub will: Option<Message>,
    /// Bound of the outbound packet queue.
    pub queue_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            clean_session: true,
            keep_alive: Duration::from_secs(60),
            version: VERSION_311,
            username: None,
            password: None,
            will: None,
            queue_size: 64,
        }
    }
}

impl ClientConfig {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    /// Set the clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the keep-alive interval. Zero disables keep-alive.
    pub fn keep_alive(mut self, interval: Duration) -> Self {
        self.keep_alive = interval;
        self
    }

    /// Set username and password.
    pub fn credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<Vec<u8>>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Set the last will and testament message.
    pub fn will(mut self, will: Message) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the MQTT protocol level.
    pub fn version(mut self, version: u8) -> Self {
        self.version = version;
        self
    }

    /// The keep-alive value carried in CONNECT, in seconds.
    pub fn keep_alive_secs(&self) -> u16 {
        self.keep_alive.as_secs().min(u16::MAX as u64) as u16
    }
}

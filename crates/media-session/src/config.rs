use std::time::Duration;

use webrtc::ice_transport::ice_server::RTCIceServer;

pub type IceServer = RTCIceServer;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_OFFER_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_OFFER_POLL_ATTEMPTS: u32 = 30;

/// Settings shared by every call an engine negotiates.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// STUN/TURN servers handed to the peer transport.
    pub ice_servers: Vec<IceServer>,
    /// Delay between responder reads of the session record.
    pub offer_poll_interval: Duration,
    /// Reads the responder makes before giving up on the offer.
    pub offer_poll_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![RTCIceServer {
                urls: vec![DEFAULT_STUN_URL.to_string()],
                ..Default::default()
            }],
            offer_poll_interval: DEFAULT_OFFER_POLL_INTERVAL,
            offer_poll_attempts: DEFAULT_OFFER_POLL_ATTEMPTS,
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// No ICE servers; host candidates only.
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }

    /// Longest a responder waits for an offer before timing out.
    pub fn offer_wait_ceiling(&self) -> Duration {
        self.offer_poll_interval * self.offer_poll_attempts.saturating_sub(1)
    }

    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads `CALLROOM_*` settings through `lookup`, falling back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = EngineConfigBuilder::new();

        if lookup("CALLROOM_LOCALHOST_ONLY").is_none() {
            let stun = lookup("CALLROOM_STUN_URLS")
                .map(|raw| split_urls(&raw))
                .unwrap_or_else(|| vec![DEFAULT_STUN_URL.to_string()]);
            if !stun.is_empty() {
                builder = builder.add_ice_server(stun);
            }
            if let Some(turn) = lookup("CALLROOM_TURN_URL") {
                let username = lookup("CALLROOM_TURN_USERNAME")
                    .ok_or("CALLROOM_TURN_USERNAME is required with CALLROOM_TURN_URL")?;
                let credential = lookup("CALLROOM_TURN_CREDENTIAL")
                    .ok_or("CALLROOM_TURN_CREDENTIAL is required with CALLROOM_TURN_URL")?;
                builder =
                    builder.add_ice_server_with_credentials(split_urls(&turn), username, credential);
            }
        }

        if let Some(raw) = lookup("CALLROOM_OFFER_POLL_INTERVAL_MS") {
            let millis: u64 = raw
                .trim()
                .parse()
                .map_err(|_| format!("invalid CALLROOM_OFFER_POLL_INTERVAL_MS: {raw}"))?;
            builder = builder.offer_poll_interval(Duration::from_millis(millis));
        }
        if let Some(raw) = lookup("CALLROOM_OFFER_POLL_ATTEMPTS") {
            let attempts: u32 = raw
                .trim()
                .parse()
                .map_err(|_| format!("invalid CALLROOM_OFFER_POLL_ATTEMPTS: {raw}"))?;
            builder = builder.offer_poll_attempts(attempts);
        }

        builder.build()
    }
}

fn split_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// Builder for [`EngineConfig`]
#[derive(Default)]
pub struct EngineConfigBuilder {
    ice_servers: Vec<IceServer>,
    offer_poll_interval: Option<Duration>,
    offer_poll_attempts: Option<u32>,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_ice_server(mut self, urls: Vec<String>) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            ..Default::default()
        });
        self
    }

    pub fn add_ice_server_with_credentials(
        mut self,
        urls: Vec<String>,
        username: String,
        credential: String,
    ) -> Self {
        self.ice_servers.push(RTCIceServer {
            urls,
            username,
            credential,
            ..Default::default()
        });
        self
    }

    pub fn offer_poll_interval(mut self, interval: Duration) -> Self {
        self.offer_poll_interval = Some(interval);
        self
    }

    pub fn offer_poll_attempts(mut self, attempts: u32) -> Self {
        self.offer_poll_attempts = Some(attempts);
        self
    }

    pub fn build(self) -> Result<EngineConfig, String> {
        let offer_poll_interval = self
            .offer_poll_interval
            .unwrap_or(DEFAULT_OFFER_POLL_INTERVAL);
        if offer_poll_interval.is_zero() {
            return Err("offer poll interval must be non-zero".to_string());
        }
        let offer_poll_attempts = self
            .offer_poll_attempts
            .unwrap_or(DEFAULT_OFFER_POLL_ATTEMPTS);
        if offer_poll_attempts == 0 {
            return Err("offer poll attempts must be at least 1".to_string());
        }

        Ok(EngineConfig {
            ice_servers: self.ice_servers,
            offer_poll_interval,
            offer_poll_attempts,
        })
    }
}

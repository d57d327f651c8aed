use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use media_session::EngineConfig;
use signaling_store::DEFAULT_RETENTION;

#[derive(Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    /// How often the janitor sweeps for abandoned sessions.
    pub janitor_interval: Duration,
    /// Age after which an `active` session is marked expired.
    pub session_retention: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let engine = EngineConfig::from_lookup(&lookup).map_err(|err| anyhow!(err))?;
        let janitor_interval = seconds(
            &lookup,
            "CALLROOM_JANITOR_INTERVAL_SECS",
            Duration::from_secs(300),
        )?;
        let session_retention =
            seconds(&lookup, "CALLROOM_SESSION_RETENTION_SECS", DEFAULT_RETENTION)?;

        Ok(Self {
            engine,
            janitor_interval,
            session_retention,
        })
    }
}

/// Whole, positive seconds from `key`, or `default` when unset.
fn seconds<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    let secs: u64 = raw
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got {raw:?}"))?;
    if secs == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

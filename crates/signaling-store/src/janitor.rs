use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{CallSessionPatch, SessionStatus, SignalingStore, StoreResult};

/// Sessions left `active` for longer than this are considered abandoned.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(2 * 60 * 60);

/// Shortest period [`Janitor::spawn`] sweeps at; shorter requests are raised to it.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Marks every `active` session created more than `retention` before `now` as `expired`.
///
/// Returns the number of sessions expired. A failure on one record is logged and does
/// not stop the sweep; failing to list sessions is returned to the caller.
pub async fn expire_stale(
    store: &dyn SignalingStore,
    now: OffsetDateTime,
    retention: Duration,
) -> StoreResult<usize> {
    let active = store.list_by_status(SessionStatus::Active).await?;
    let mut expired = 0;
    for session in active {
        let Some(created_at) = session.created_at else {
            continue;
        };
        let age = now - created_at;
        if age.whole_milliseconds() <= retention.as_millis() as i128 {
            continue;
        }
        match store
            .update(
                &session.session_id,
                CallSessionPatch::default().status(SessionStatus::Expired),
            )
            .await
        {
            Ok(true) => expired += 1,
            // Deleted since the listing.
            Ok(false) => {}
            Err(err) => warn!(
                target: "signaling_store::janitor",
                session_id = %session.session_id,
                error = %err,
                "failed to expire session"
            ),
        }
    }
    if expired > 0 {
        info!(target: "signaling_store::janitor", expired, "expired stale call sessions");
    }
    Ok(expired)
}

/// Background sweep running [`expire_stale`] on a fixed interval.
pub struct Janitor {
    handle: JoinHandle<()>,
}

impl Janitor {
    pub fn spawn(store: Arc<dyn SignalingStore>, interval: Duration, retention: Duration) -> Self {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(
                target: "signaling_store::janitor",
                requested = ?interval,
                used = ?MIN_SWEEP_INTERVAL,
                "sweep interval too short; raised"
            );
        }
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) =
                    expire_stale(store.as_ref(), OffsetDateTime::now_utc(), retention).await
                {
                    warn!(target: "signaling_store::janitor", error = %err, "sweep failed");
                }
            }
        });
        Self { handle }
    }

    pub fn shutdown(self) {
        self.handle.abort();
    }
}

impl Drop for Janitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use parking_lot::Mutex;
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_INACTIVITY_WINDOW: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub login_time: u64,
    pub last_activity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineSession {
    pub identity: String,
    pub login_time: u64,
    pub last_activity: u64,
}

#[derive(Debug, Default)]
struct SessionMaps {
    active: HashMap<String, Session>,
    logged_out: HashMap<String, u64>,
}

/// Logged-in identities and their last activity. Timestamps are unix
/// seconds supplied by the caller.
///
/// Expiry is applied only by [`SessionTracker::sweep_expired`]; listings hide
/// idle sessions without removing them.
#[derive(Debug)]
pub struct SessionTracker {
    inactivity_window_secs: u64,
    maps: Mutex<SessionMaps>,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_INACTIVITY_WINDOW)
    }
}

impl SessionTracker {
    pub fn new(inactivity_window: Duration) -> Self {
        Self {
            inactivity_window_secs: inactivity_window.as_secs(),
            maps: Mutex::new(SessionMaps::default()),
        }
    }

    pub fn inactivity_window(&self) -> Duration {
        Duration::from_secs(self.inactivity_window_secs)
    }

    fn is_idle(&self, session: &Session, now_unix_secs: u64) -> bool {
        now_unix_secs.saturating_sub(session.last_activity) > self.inactivity_window_secs
    }

    /// Starts a fresh session, replacing any previous one for `identity`.
    pub fn login(&self, identity: &str, now_unix_secs: u64) {
        let mut maps = self.maps.lock();
        maps.active.insert(
            identity.to_string(),
            Session {
                login_time: now_unix_secs,
                last_activity: now_unix_secs,
            },
        );
        debug!(identity, "session started");
    }

    /// Returns false when `identity` has no session.
    pub fn heartbeat(&self, identity: &str, now_unix_secs: u64) -> bool {
        let mut maps = self.maps.lock();
        match maps.active.get_mut(identity) {
            Some(session) => {
                session.last_activity = session.last_activity.max(now_unix_secs);
                true
            }
            None => false,
        }
    }

    /// Returns false when `identity` had no session.
    pub fn logout(&self, identity: &str) -> bool {
        let mut maps = self.maps.lock();
        match maps.active.remove(identity) {
            Some(session) => {
                maps.logged_out
                    .insert(identity.to_string(), session.last_activity);
                debug!(identity, "session ended by logout");
                true
            }
            None => false,
        }
    }

    /// Sessions active at `now_unix_secs`, sorted by identity.
    pub fn list_online(&self, now_unix_secs: u64) -> Vec<OnlineSession> {
        let maps = self.maps.lock();
        let mut online: Vec<OnlineSession> = maps
            .active
            .iter()
            .filter(|(_, session)| !self.is_idle(session, now_unix_secs))
            .map(|(identity, session)| OnlineSession {
                identity: identity.clone(),
                login_time: session.login_time,
                last_activity: session.last_activity,
            })
            .collect();
        online.sort_by(|a, b| a.identity.cmp(&b.identity));
        online
    }

    /// Moves every idle session into the logout history and returns the
    /// affected identities, sorted.
    pub fn sweep_expired(&self, now_unix_secs: u64) -> Vec<String> {
        let mut maps = self.maps.lock();
        let mut expired: Vec<String> = maps
            .active
            .iter()
            .filter(|(_, session)| self.is_idle(session, now_unix_secs))
            .map(|(identity, _)| identity.clone())
            .collect();
        expired.sort();
        for identity in &expired {
            if let Some(session) = maps.active.remove(identity) {
                maps.logged_out
                    .insert(identity.clone(), session.last_activity);
            }
        }
        expired
    }

    pub fn session(&self, identity: &str) -> Option<Session> {
        self.maps.lock().active.get(identity).copied()
    }

    /// Last activity of every identity whose session ended, keyed by identity.
    pub fn logout_history(&self) -> BTreeMap<String, u64> {
        self.maps
            .lock()
            .logged_out
            .iter()
            .map(|(identity, last_activity)| (identity.clone(), *last_activity))
            .collect()
    }
}

/// Periodically expires idle sessions. The first sweep runs immediately.
pub fn spawn_expiry_sweeper(tracker: Arc<SessionTracker>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let expired = tracker.sweep_expired(now_unix_secs());
            if !expired.is_empty() {
                info!(count = expired.len(), identities = ?expired, "expired idle sessions");
            }
        }
    })
}

pub fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}

/// Compares two secrets in time independent of where they differ.
pub fn secrets_match(provided: &str, expected: &str) -> bool {
    constant_time_eq(provided.as_bytes(), expected.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (left, right) in a.iter().zip(b) {
        diff |= left ^ right;
    }
    diff == 0
}

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Duration, Utc};

use shared::domain::{PresenceStatus, UserId};

/// Seconds after a disconnect during which a user still reads as recently
/// online. Classification happens at read time; nothing stores this state.
pub const RECENTLY_ONLINE_WINDOW_SECS: i64 = 5 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceChange {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
}

/// Owns last-seen timestamps and turns registry transitions into presence
/// changes. Emits at most one change per offline↔online edge so event
/// volume stays proportional to transitions, not connections. Process
/// lifetime only; a restart forgets everything.
#[derive(Default)]
pub struct PresenceTracker {
    last_seen: Mutex<HashMap<UserId, DateTime<Utc>>>,
}

impl PresenceTracker {
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, DateTime<Utc>>> {
        self.last_seen
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Records activity for a connect. Returns a change only when the
    /// registry reported an offline→online transition.
    pub fn mark_connected(&self, user_id: UserId, came_online: bool) -> Option<PresenceChange> {
        let now = Utc::now();
        self.lock().insert(user_id, now);
        came_online.then_some(PresenceChange {
            user_id,
            status: PresenceStatus::Online,
            last_seen_at: now,
        })
    }

    /// Records activity for a disconnect. Returns a change only when the
    /// user's last connection went away.
    pub fn mark_disconnected(&self, user_id: UserId, went_offline: bool) -> Option<PresenceChange> {
        let now = Utc::now();
        self.lock().insert(user_id, now);
        went_offline.then_some(PresenceChange {
            user_id,
            status: PresenceStatus::Offline,
            last_seen_at: now,
        })
    }

    /// Refreshes last-seen for an explicit presence update frame.
    pub fn touch(&self, user_id: UserId) -> DateTime<Utc> {
        let now = Utc::now();
        self.lock().insert(user_id, now);
        now
    }

    pub fn last_seen(&self, user_id: UserId) -> Option<DateTime<Utc>> {
        self.lock().get(&user_id).copied()
    }

    /// Read-time status: the caller supplies whether the registry currently
    /// holds a connection for the user.
    pub fn classify(&self, user_id: UserId, online: bool) -> (PresenceStatus, Option<DateTime<Utc>>) {
        let last_seen = self.last_seen(user_id);
        (classify_at(online, last_seen, Utc::now()), last_seen)
    }
}

fn classify_at(
    online: bool,
    last_seen: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PresenceStatus {
    if online {
        return PresenceStatus::Online;
    }
    match last_seen {
        Some(seen) if now - seen <= Duration::seconds(RECENTLY_ONLINE_WINDOW_SECS) => {
            PresenceStatus::RecentlyOnline
        }
        _ => PresenceStatus::Offline,
    }
}

//! Per-host cached state for multi-host failover and load balancing.
//!
//! One process-wide cache maps host:port to its last observed role and the
//! time of that observation. Entries are copied out under the lock and
//! refreshed by the pool when they are older than `HostRecheckSeconds`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::config::{ConnectionString, HostSpec, TargetSessionAttributes};

/// What we last learned about a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRole {
    Unknown,
    Primary,
    Standby,
    Offline,
}

#[derive(Debug, Clone, Copy)]
struct HostEntry {
    role: HostRole,
    checked_at: Instant,
}

static HOST_ROLES: Lazy<Mutex<HashMap<(String, u16), HostEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

// With HostRecheckSeconds=0 roles are cached forever, but a dead host must
// still come back eventually.
const OFFLINE_RETRY: Duration = Duration::from_secs(10);

fn key(host: &HostSpec) -> (String, u16) {
    (host.host.clone(), host.port)
}

/// The cached role, or `Unknown` when absent or stale.
pub fn cached_role(host: &HostSpec, recheck_seconds: u64) -> HostRole {
    let entry = match HOST_ROLES.lock().get(&key(host)) {
        Some(entry) => *entry,
        None => return HostRole::Unknown,
    };
    let age = entry.checked_at.elapsed();
    let stale = if recheck_seconds == 0 {
        entry.role == HostRole::Offline && age > OFFLINE_RETRY
    } else {
        age > Duration::from_secs(recheck_seconds)
    };
    if stale {
        HostRole::Unknown
    } else {
        entry.role
    }
}

pub fn update_role(host: &HostSpec, role: HostRole) {
    HOST_ROLES.lock().insert(
        key(host),
        HostEntry {
            role,
            checked_at: Instant::now(),
        },
    );
}

/// Connection refused: keep the host out of rotation until the recheck
/// window passes.
pub fn mark_offline(host: &HostSpec) {
    update_role(host, HostRole::Offline);
}

#[cfg(test)]
pub fn insert_aged_for_test(host: &HostSpec, role: HostRole, age: Duration) {
    HOST_ROLES.lock().insert(
        key(host),
        HostEntry {
            role,
            checked_at: Instant::now() - age,
        },
    );
}

/// Whether a host with this role may serve the target at all. Unknown hosts
/// always may; the pool verifies after connecting.
pub fn role_may_serve(target: TargetSessionAttributes, role: HostRole) -> bool {
    match (target, role) {
        (_, HostRole::Offline) => false,
        (_, HostRole::Unknown) => true,
        (TargetSessionAttributes::Any, _) => true,
        (
            TargetSessionAttributes::Primary | TargetSessionAttributes::ReadWrite,
            role,
        ) => role == HostRole::Primary,
        (
            TargetSessionAttributes::Standby | TargetSessionAttributes::ReadOnly,
            role,
        ) => role == HostRole::Standby,
        // The prefer targets fall through to any live host.
        (TargetSessionAttributes::PreferPrimary | TargetSessionAttributes::PreferStandby, _) => {
            true
        }
    }
}

/// The role the prefer-variants would rather have.
fn preferred_role(target: TargetSessionAttributes) -> Option<HostRole> {
    match target {
        TargetSessionAttributes::PreferPrimary => Some(HostRole::Primary),
        TargetSessionAttributes::PreferStandby => Some(HostRole::Standby),
        _ => None,
    }
}

/// Order host indices for a rent attempt: round-robin rotation when load
/// balancing, preferred roles first, offline hosts excluded.
pub fn candidate_order(settings: &ConnectionString, round_robin: &AtomicUsize) -> Vec<usize> {
    let count = settings.hosts.len();
    let mut order: Vec<usize> = (0..count).collect();
    if settings.load_balance_hosts && count > 1 {
        let start = round_robin.fetch_add(1, Ordering::Relaxed) % count;
        order.rotate_left(start);
    }

    let target = settings.target_session_attributes;
    let recheck = settings.host_recheck_seconds;
    let roles: Vec<HostRole> = order
        .iter()
        .map(|&i| cached_role(&settings.hosts[i], recheck))
        .collect();

    let mut candidates: Vec<usize> = Vec::with_capacity(count);
    if let Some(preferred) = preferred_role(target) {
        for (slot, &i) in order.iter().enumerate() {
            if roles[slot] == preferred || roles[slot] == HostRole::Unknown {
                candidates.push(i);
            }
        }
        for (slot, &i) in order.iter().enumerate() {
            if roles[slot] != preferred
                && roles[slot] != HostRole::Unknown
                && roles[slot] != HostRole::Offline
            {
                candidates.push(i);
            }
        }
    } else {
        for (slot, &i) in order.iter().enumerate() {
            if role_may_serve(target, roles[slot]) {
                candidates.push(i);
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn settings(hosts: &str, extra: &str) -> ConnectionString {
        ConnectionString::parse(&format!("Host={hosts};{extra}")).unwrap()
    }

    #[test]
    fn round_robin_rotates_candidates() {
        let settings = settings("rr-a,rr-b,rr-c", "LoadBalanceHosts=true");
        let counter = AtomicUsize::new(0);
        assert_eq!(candidate_order(&settings, &counter), vec![0, 1, 2]);
        assert_eq!(candidate_order(&settings, &counter), vec![1, 2, 0]);
        assert_eq!(candidate_order(&settings, &counter), vec![2, 0, 1]);
        assert_eq!(candidate_order(&settings, &counter), vec![0, 1, 2]);
    }

    #[test]
    fn offline_hosts_leave_the_rotation_until_rechecked() {
        let settings = settings("off-a,off-b", "");
        mark_offline(&settings.hosts[0]);
        let counter = AtomicUsize::new(0);
        assert_eq!(candidate_order(&settings, &counter), vec![1]);

        // A stale offline entry reads as Unknown again.
        insert_aged_for_test(
            &settings.hosts[0],
            HostRole::Offline,
            Duration::from_secs(60),
        );
        assert_eq!(candidate_order(&settings, &counter), vec![0, 1]);
    }

    #[test]
    fn primary_target_excludes_known_standbys() {
        let settings = settings("pt-a,pt-b", "TargetSessionAttributes=primary");
        update_role(&settings.hosts[0], HostRole::Standby);
        update_role(&settings.hosts[1], HostRole::Primary);
        let counter = AtomicUsize::new(0);
        assert_eq!(candidate_order(&settings, &counter), vec![1]);
    }

    #[test]
    fn prefer_standby_falls_through_to_primary() {
        let settings = settings("ps-a,ps-b", "TargetSessionAttributes=prefer-standby");
        update_role(&settings.hosts[0], HostRole::Primary);
        update_role(&settings.hosts[1], HostRole::Standby);
        let counter = AtomicUsize::new(0);
        assert_eq!(candidate_order(&settings, &counter), vec![1, 0]);
    }

    #[test]
    fn roles_expire_after_the_recheck_window() {
        let settings = settings("ttl-a", "HostRecheckSeconds=5");
        insert_aged_for_test(
            &settings.hosts[0],
            HostRole::Primary,
            Duration::from_secs(6),
        );
        assert_eq!(cached_role(&settings.hosts[0], 5), HostRole::Unknown);

        insert_aged_for_test(
            &settings.hosts[0],
            HostRole::Primary,
            Duration::from_secs(2),
        );
        assert_eq!(cached_role(&settings.hosts[0], 5), HostRole::Primary);

        // Zero disables rechecking entirely for live roles.
        insert_aged_for_test(
            &settings.hosts[0],
            HostRole::Primary,
            Duration::from_secs(3600),
        );
        assert_eq!(cached_role(&settings.hosts[0], 0), HostRole::Primary);
    }
}

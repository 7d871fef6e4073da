//! Per-zone revisions, read-your-writes waits, and zookies.
//!
//! A zookie is `base64url("v1:{zone}:{revision}:{mac}")` where `mac` is a
//! keyed BLAKE3 hash of `zone:revision`, truncated to 16 hex chars. Tokens
//! from another zone or with a bad mac are rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::error::{RebacError, Result};

const TOKEN_VERSION: &str = "v1";
const MAC_HEX_LEN: usize = 16;
const KEY_CONTEXT: &str = "nexus_rebac 2025 zookie signing key";

/// How fresh a read must be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consistency {
    /// Use whatever cache state exists; never wait.
    Eventual,
    /// Wait only when a zookie is supplied.
    MinimizeLatency(Option<String>),
    /// Always wait for the zookie's revision.
    AtLeastAsFresh(String),
    /// Bypass every cache and evaluate against the store.
    FullyConsistent,
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::MinimizeLatency(None)
    }
}

impl Consistency {
    /// Zookie the caller must observe before reading, if any.
    pub fn required_token(&self) -> Option<&str> {
        match self {
            Consistency::MinimizeLatency(token) => token.as_deref(),
            Consistency::AtLeastAsFresh(token) => Some(token),
            Consistency::Eventual | Consistency::FullyConsistent => None,
        }
    }

    pub fn bypasses_caches(&self) -> bool {
        matches!(self, Consistency::FullyConsistent)
    }
}

#[derive(Debug, Default)]
struct ZoneRevision {
    revision: AtomicU64,
    lock: Mutex<()>,
    advanced: Condvar,
}

/// Monotonic revision per zone plus the zookie codec.
pub struct RevisionManager {
    zones: DashMap<String, Arc<ZoneRevision>>,
    key: [u8; 32],
}

impl RevisionManager {
    /// `secret` keys the zookie mac; without one a random per-instance key is
    /// used, so tokens only verify against this instance.
    pub fn new(secret: Option<&str>) -> Self {
        let key = match secret {
            Some(secret) => blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
            None => {
                let mut material = [0u8; 32];
                material[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
                material[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
                blake3::derive_key(KEY_CONTEXT, &material)
            }
        };
        Self {
            zones: DashMap::new(),
            key,
        }
    }

    fn zone(&self, zone_id: &str) -> Arc<ZoneRevision> {
        if let Some(zone) = self.zones.get(zone_id) {
            return zone.value().clone();
        }
        self.zones
            .entry(zone_id.to_string())
            .or_default()
            .value()
            .clone()
    }

    /// Whether `zone_id` has seen any revision yet.
    pub fn is_tracked(&self, zone_id: &str) -> bool {
        self.zones.contains_key(zone_id)
    }

    pub fn current(&self, zone_id: &str) -> u64 {
        self.zones
            .get(zone_id)
            .map(|z| z.revision.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Advance `zone_id` to `revision`. Never regresses.
    pub fn notify_revision(&self, zone_id: &str, revision: u64) {
        let zone = self.zone(zone_id);
        let _guard = zone.lock.lock();
        let previous = zone.revision.fetch_max(revision, Ordering::AcqRel);
        if revision > previous {
            zone.advanced.notify_all();
        }
    }

    /// Block until `zone_id` reaches `min_revision`. `false` on timeout, which
    /// means freshness could not be confirmed, not that access is denied.
    pub fn wait_for_revision(&self, zone_id: &str, min_revision: u64, timeout: Duration) -> bool {
        let zone = self.zone(zone_id);
        if zone.revision.load(Ordering::Acquire) >= min_revision {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = zone.lock.lock();
        loop {
            if zone.revision.load(Ordering::Acquire) >= min_revision {
                return true;
            }
            if zone.advanced.wait_until(&mut guard, deadline).timed_out() {
                return zone.revision.load(Ordering::Acquire) >= min_revision;
            }
        }
    }

    fn mac(&self, zone_id: &str, revision: u64) -> String {
        let hash = blake3::keyed_hash(&self.key, format!("{zone_id}:{revision}").as_bytes());
        hash.to_hex().as_str()[..MAC_HEX_LEN].to_string()
    }

    pub fn encode(&self, zone_id: &str, revision: u64) -> String {
        let raw = format!(
            "{TOKEN_VERSION}:{zone_id}:{revision}:{}",
            self.mac(zone_id, revision)
        );
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Decode and verify a zookie into `(zone_id, revision)`.
    pub fn decode(&self, token: &str) -> Result<(String, u64)> {
        let invalid = |why: &str| RebacError::InvalidToken(why.to_string());
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| invalid("not base64url"))?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid("not utf-8"))?;

        let rest = raw
            .strip_prefix(TOKEN_VERSION)
            .and_then(|r| r.strip_prefix(':'))
            .ok_or_else(|| invalid("unknown version"))?;
        // zone ids may contain ':'; revision and mac never do
        let mut tail = rest.rsplitn(3, ':');
        let mac = tail.next().ok_or_else(|| invalid("missing mac"))?;
        let revision = tail
            .next()
            .and_then(|r| r.parse::<u64>().ok())
            .ok_or_else(|| invalid("bad revision"))?;
        let zone_id = tail.next().ok_or_else(|| invalid("missing zone"))?;

        if mac != self.mac(zone_id, revision) {
            return Err(invalid("tamper check failed"));
        }
        Ok((zone_id.to_string(), revision))
    }

    /// Decode a zookie presented for `zone_id`; tokens from other zones fail.
    pub fn decode_for_zone(&self, token: &str, zone_id: &str) -> Result<u64> {
        let (token_zone, revision) = self.decode(token)?;
        if token_zone != zone_id {
            return Err(RebacError::CrossZoneViolation {
                relation: "zookie".to_string(),
                from_zone: token_zone,
                to_zone: zone_id.to_string(),
            });
        }
        Ok(revision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn revisions_never_regress() {
        let manager = RevisionManager::new(None);
        assert_eq!(manager.current("z"), 0);
        manager.notify_revision("z", 5);
        manager.notify_revision("z", 3);
        assert_eq!(manager.current("z"), 5);
        assert_eq!(manager.current("other"), 0);
    }

    #[test]
    fn wait_returns_immediately_when_fresh() {
        let manager = RevisionManager::new(None);
        manager.notify_revision("z", 2);
        assert!(manager.wait_for_revision("z", 2, Duration::from_millis(0)));
    }

    #[test]
    fn wait_times_out() {
        let manager = RevisionManager::new(None);
        let started = Instant::now();
        assert!(!manager.wait_for_revision("z", 1, Duration::from_millis(30)));
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_wakes_on_notify() {
        let manager = Arc::new(RevisionManager::new(None));
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_for_revision("z", 3, Duration::from_secs(5)))
        };
        thread::sleep(Duration::from_millis(20));
        manager.notify_revision("z", 1);
        manager.notify_revision("z", 3);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn token_roundtrip_and_zone_check() {
        let manager = RevisionManager::new(Some("secret"));
        let token = manager.encode("acme", 42);
        assert_eq!(manager.decode(&token).unwrap(), ("acme".to_string(), 42));
        assert_eq!(manager.decode_for_zone(&token, "acme").unwrap(), 42);
        assert!(matches!(
            manager.decode_for_zone(&token, "globex"),
            Err(RebacError::CrossZoneViolation { .. })
        ));
    }

    #[test]
    fn zone_ids_with_colons_survive() {
        let manager = RevisionManager::new(None);
        let token = manager.encode("org:acme", 7);
        assert_eq!(manager.decode(&token).unwrap(), ("org:acme".to_string(), 7));
    }

    #[test]
    fn tampered_or_foreign_tokens_are_rejected() {
        let manager = RevisionManager::new(Some("secret"));
        let forged = URL_SAFE_NO_PAD.encode("v1:acme:999:0000000000000000");
        assert!(matches!(manager.decode(&forged), Err(RebacError::InvalidToken(_))));
        assert!(matches!(manager.decode("%%%"), Err(RebacError::InvalidToken(_))));

        let other = RevisionManager::new(Some("different"));
        let token = other.encode("acme", 1);
        assert!(matches!(manager.decode(&token), Err(RebacError::InvalidToken(_))));

        let same_secret = RevisionManager::new(Some("secret"));
        assert!(same_secret.decode(&manager.encode("acme", 1)).is_ok());
    }

    #[test]
    fn consistency_tokens() {
        assert_eq!(Consistency::default().required_token(), None);
        assert_eq!(
            Consistency::AtLeastAsFresh("t".into()).required_token(),
            Some("t")
        );
        assert!(Consistency::FullyConsistent.bypasses_caches());
        assert!(!Consistency::Eventual.bypasses_caches());
    }
}

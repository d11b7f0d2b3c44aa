use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{FromRedisValue, Script, ScriptInvocation};
use tokio::time::{timeout, Instant};
use tracing::info;
use uuid::Uuid;

use crate::error::DedupError;
use crate::fingerprint::Fingerprint;

const KEY_PREFIX: &str = "processed:";
const FORWARDED: &str = "forwarded";

// KEYS[1] = key, ARGV[1] = owner token, ARGV[2] = lease in ms.
// Extends our own lease, or takes the key back if it has expired meanwhile.
const RENEW_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if current == ARGV[1] then
        return redis.call('PEXPIRE', KEYS[1], ARGV[2])
    elseif not current then
        redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
        return 1
    end
    return 0
"#;

// KEYS[1] = key, ARGV[1] = owner token, ARGV[2] = forwarded marker, ARGV[3] = retention in s.
const CONFIRM_SCRIPT: &str = r#"
    local current = redis.call('GET', KEYS[1])
    if current == ARGV[2] then
        return 1
    elseif current == ARGV[1] or not current then
        redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
        return 1
    end
    return 0
"#;

// KEYS[1] = key, ARGV[1] = owner token.
const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Owner token of a pending claim. Only the holder of the token may renew, confirm or
/// release the claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease(String);

impl Lease {
    fn generate() -> Self {
        Lease(Uuid::now_v7().to_string())
    }
}

impl fmt::Display for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outcome of claiming a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// Never seen, or its entry expired. The caller now holds the lease.
    New(Lease),
    /// Already forwarded within the retention window.
    Duplicate,
    /// Someone holds a pending lease that has neither been confirmed nor released yet.
    InFlight,
}

/// A time-bounded set of fingerprints that were forwarded to the sink.
///
/// Claims are two-phase. `check_and_mark` atomically takes a short lease on a new
/// fingerprint. The holder keeps it alive with `renew` while forwarding, turns it into a
/// retained entry with `confirm` once the forward succeeded, or drops it with `release` when
/// it failed. A lease that ran out and was taken by someone else can no longer be renewed,
/// confirmed over or released by its previous holder.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn check_and_mark(&self, fingerprint: &Fingerprint) -> Result<Claim, DedupError>;

    /// Push the lease expiry forward. Returns false when someone else holds the fingerprint.
    async fn renew(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<bool, DedupError>;

    /// Returns false when the lease was lost to another holder, which is left untouched.
    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        lease: &Lease,
    ) -> Result<bool, DedupError>;

    async fn release(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<(), DedupError>;

    /// How long a claim stays pending without being renewed.
    fn lease_duration(&self) -> time::Duration;
}

pub struct RedisDedupStore {
    connection: ConnectionManager,
    lease: time::Duration,
    retention: time::Duration,
    timeout: time::Duration,
    renew_script: Script,
    confirm_script: Script,
    release_script: Script,
}

impl RedisDedupStore {
    pub async fn new(
        url: &str,
        lease: time::Duration,
        retention: time::Duration,
        timeout: time::Duration,
    ) -> Result<Self, DedupError> {
        info!("connecting to dedup store...");
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| DedupError::Timeout)??;

        Ok(Self {
            connection,
            lease,
            retention,
            timeout,
            renew_script: Script::new(RENEW_SCRIPT),
            confirm_script: Script::new(CONFIRM_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
        })
    }

    fn key(fingerprint: &Fingerprint) -> String {
        format!("{}{}", KEY_PREFIX, fingerprint)
    }

    fn lease_ms(&self) -> u64 {
        (self.lease.as_millis() as u64).max(1)
    }

    async fn query<T: FromRedisValue + Send>(&self, cmd: &redis::Cmd) -> Result<T, DedupError> {
        let mut connection = self.connection.clone();
        let result = timeout(self.timeout, cmd.query_async::<_, T>(&mut connection))
            .await
            .map_err(|_| DedupError::Timeout)?;

        Ok(result?)
    }

    async fn invoke<T: FromRedisValue + Send>(
        &self,
        invocation: &ScriptInvocation<'_>,
    ) -> Result<T, DedupError> {
        let mut connection = self.connection.clone();
        let result = timeout(
            self.timeout,
            invocation.invoke_async::<_, T>(&mut connection),
        )
        .await
        .map_err(|_| DedupError::Timeout)?;

        Ok(result?)
    }
}

#[async_trait]
impl DedupStore for RedisDedupStore {
    async fn check_and_mark(&self, fingerprint: &Fingerprint) -> Result<Claim, DedupError> {
        let key = Self::key(fingerprint);
        let lease = Lease::generate();

        let mut set = redis::cmd("SET");
        set.arg(&key)
            .arg(&lease.0)
            .arg("NX")
            .arg("PX")
            .arg(self.lease_ms());
        let claimed: Option<String> = self.query(&set).await?;
        if claimed.is_some() {
            return Ok(Claim::New(lease));
        }

        let mut get = redis::cmd("GET");
        get.arg(&key);
        let state: Option<String> = self.query(&get).await?;

        Ok(match state.as_deref() {
            Some(FORWARDED) => Claim::Duplicate,
            // Expired between the two calls: report it busy, the next claim will win it.
            _ => Claim::InFlight,
        })
    }

    async fn renew(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<bool, DedupError> {
        let mut invocation = self.renew_script.prepare_invoke();
        invocation
            .key(Self::key(fingerprint))
            .arg(&lease.0)
            .arg(self.lease_ms());

        let held: i64 = self.invoke(&invocation).await?;
        Ok(held == 1)
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        lease: &Lease,
    ) -> Result<bool, DedupError> {
        let mut invocation = self.confirm_script.prepare_invoke();
        invocation
            .key(Self::key(fingerprint))
            .arg(&lease.0)
            .arg(FORWARDED)
            .arg(self.retention.as_secs().max(1));

        let confirmed: i64 = self.invoke(&invocation).await?;
        Ok(confirmed == 1)
    }

    async fn release(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<(), DedupError> {
        let mut invocation = self.release_script.prepare_invoke();
        invocation.key(Self::key(fingerprint)).arg(&lease.0);

        self.invoke::<i64>(&invocation).await?;
        Ok(())
    }

    fn lease_duration(&self) -> time::Duration {
        self.lease
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EntryState {
    Pending(Lease),
    Forwarded,
}

#[derive(Debug, Clone)]
struct DedupEntry {
    state: EntryState,
    first_seen_at: Instant,
    expires_at: Instant,
}

impl DedupEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn is_held_by(&self, lease: &Lease, now: Instant) -> bool {
        self.is_live(now) && self.state == EntryState::Pending(lease.clone())
    }
}

struct Entries {
    by_fingerprint: HashMap<Fingerprint, DedupEntry>,
    next_sweep: Instant,
}

/// Process-local store, for tests and single-instance runs. Expiry follows the tokio clock,
/// and expired entries are swept out at most once per lease period.
pub struct MemoryDedupStore {
    entries: Mutex<Entries>,
    lease: time::Duration,
    retention: time::Duration,
}

impl MemoryDedupStore {
    pub fn new(lease: time::Duration, retention: time::Duration) -> Self {
        Self {
            entries: Mutex::new(Entries {
                by_fingerprint: HashMap::new(),
                next_sweep: Instant::now() + lease,
            }),
            lease,
            retention,
        }
    }

    /// Number of live entries, pending ones included.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .by_fingerprint
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self, now: Instant) -> std::sync::MutexGuard<'_, Entries> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());

        if now >= entries.next_sweep {
            entries.by_fingerprint.retain(|_, entry| entry.is_live(now));
            entries.next_sweep = now + self.lease;
        }

        entries
    }

    #[cfg(test)]
    fn stored(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.by_fingerprint.len()
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn check_and_mark(&self, fingerprint: &Fingerprint) -> Result<Claim, DedupError> {
        let now = Instant::now();
        let mut entries = self.lock(now);

        match entries.by_fingerprint.get(fingerprint) {
            Some(entry) if entry.is_live(now) => Ok(match entry.state {
                EntryState::Forwarded => Claim::Duplicate,
                EntryState::Pending(_) => Claim::InFlight,
            }),
            _ => {
                let lease = Lease::generate();
                entries.by_fingerprint.insert(
                    fingerprint.clone(),
                    DedupEntry {
                        state: EntryState::Pending(lease.clone()),
                        first_seen_at: now,
                        expires_at: now + self.lease,
                    },
                );
                Ok(Claim::New(lease))
            }
        }
    }

    async fn renew(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<bool, DedupError> {
        let now = Instant::now();
        let mut entries = self.lock(now);

        match entries.by_fingerprint.get_mut(fingerprint) {
            Some(entry) if entry.is_held_by(lease, now) => {
                entry.expires_at = now + self.lease;
                Ok(true)
            }
            Some(entry) if entry.is_live(now) => Ok(false),
            _ => {
                entries.by_fingerprint.insert(
                    fingerprint.clone(),
                    DedupEntry {
                        state: EntryState::Pending(lease.clone()),
                        first_seen_at: now,
                        expires_at: now + self.lease,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn confirm(
        &self,
        fingerprint: &Fingerprint,
        lease: &Lease,
    ) -> Result<bool, DedupError> {
        let now = Instant::now();
        let mut entries = self.lock(now);

        let first_seen_at = match entries.by_fingerprint.get(fingerprint) {
            Some(entry) if entry.is_live(now) && entry.state == EntryState::Forwarded => {
                return Ok(true)
            }
            Some(entry) if entry.is_live(now) && !entry.is_held_by(lease, now) => {
                return Ok(false)
            }
            Some(entry) => entry.first_seen_at,
            None => now,
        };

        entries.by_fingerprint.insert(
            fingerprint.clone(),
            DedupEntry {
                state: EntryState::Forwarded,
                first_seen_at,
                expires_at: now + self.retention,
            },
        );

        Ok(true)
    }

    async fn release(&self, fingerprint: &Fingerprint, lease: &Lease) -> Result<(), DedupError> {
        let now = Instant::now();
        let mut entries = self.lock(now);

        if matches!(entries.by_fingerprint.get(fingerprint), Some(e) if e.is_held_by(lease, now)) {
            entries.by_fingerprint.remove(fingerprint);
        }

        Ok(())
    }

    fn lease_duration(&self) -> time::Duration {
        self.lease
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryDedupStore {
        MemoryDedupStore::new(
            time::Duration::from_secs(30),
            time::Duration::from_secs(24 * 60 * 60),
        )
    }

    async fn claim(store: &MemoryDedupStore, fingerprint: &Fingerprint) -> Lease {
        match store.check_and_mark(fingerprint).await.unwrap() {
            Claim::New(lease) => lease,
            other => panic!("expected a new claim, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn confirmed_fingerprints_are_duplicates() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let lease = claim(&store, &fingerprint).await;
        assert!(store.confirm(&fingerprint, &lease).await.unwrap());

        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::Duplicate
        );
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_claims_are_in_flight_until_the_lease_expires() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        claim(&store, &fingerprint).await;
        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::InFlight
        );

        tokio::time::advance(time::Duration::from_secs(31)).await;

        claim(&store, &fingerprint).await;
    }

    #[tokio::test(start_paused = true)]
    async fn renewed_leases_outlive_their_first_period() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);
        let lease = claim(&store, &fingerprint).await;

        for _ in 0..4 {
            tokio::time::advance(time::Duration::from_secs(20)).await;
            assert!(store.renew(&fingerprint, &lease).await.unwrap());
            assert_eq!(
                store.check_and_mark(&fingerprint).await.unwrap(),
                Claim::InFlight
            );
        }

        assert!(store.confirm(&fingerprint, &lease).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_holders_cannot_touch_a_newer_claim() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let stale = claim(&store, &fingerprint).await;
        tokio::time::advance(time::Duration::from_secs(31)).await;
        let current = claim(&store, &fingerprint).await;

        assert!(!store.renew(&fingerprint, &stale).await.unwrap());
        assert!(!store.confirm(&fingerprint, &stale).await.unwrap());
        store.release(&fingerprint, &stale).await.unwrap();
        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::InFlight
        );

        assert!(store.confirm(&fingerprint, &current).await.unwrap());
        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::Duplicate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_but_untaken_leases_are_renewed() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);
        let lease = claim(&store, &fingerprint).await;

        tokio::time::advance(time::Duration::from_secs(45)).await;

        assert!(store.renew(&fingerprint, &lease).await.unwrap());
        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::InFlight
        );
    }

    #[tokio::test(start_paused = true)]
    async fn released_claims_can_be_taken_again() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let lease = claim(&store, &fingerprint).await;
        store.release(&fingerprint, &lease).await.unwrap();

        assert!(store.is_empty());
        claim(&store, &fingerprint).await;
    }

    #[tokio::test(start_paused = true)]
    async fn release_does_not_drop_confirmed_entries() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let lease = claim(&store, &fingerprint).await;
        store.confirm(&fingerprint, &lease).await.unwrap();
        store.release(&fingerprint, &lease).await.unwrap();

        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::Duplicate
        );
    }

    #[tokio::test(start_paused = true)]
    async fn forwarded_entries_expire_after_retention() {
        let store = store();
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let lease = claim(&store, &fingerprint).await;
        store.confirm(&fingerprint, &lease).await.unwrap();

        tokio::time::advance(time::Duration::from_secs(24 * 60 * 60 - 1)).await;
        assert_eq!(
            store.check_and_mark(&fingerprint).await.unwrap(),
            Claim::Duplicate
        );

        tokio::time::advance(time::Duration::from_secs(2)).await;
        assert!(store.is_empty());
        claim(&store, &fingerprint).await;
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_swept() {
        let store = MemoryDedupStore::new(
            time::Duration::from_secs(30),
            time::Duration::from_secs(60),
        );

        for n in 0..1000 {
            let fingerprint = Fingerprint::of(format!(r#"{{"id":"{}"}}"#, n).as_bytes());
            let lease = claim(&store, &fingerprint).await;
            store.confirm(&fingerprint, &lease).await.unwrap();
        }
        assert_eq!(store.stored(), 1000);

        tokio::time::advance(time::Duration::from_secs(3600)).await;
        claim(&store, &Fingerprint::of(br#"{"id":"new"}"#)).await;

        assert_eq!(store.len(), 1);
        assert_eq!(store.stored(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_claims_have_a_single_winner() {
        let store = std::sync::Arc::new(store());
        let fingerprint = Fingerprint::of(br#"{"id":"1"}"#);

        let mut set = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let store = store.clone();
            let fingerprint = fingerprint.clone();
            set.spawn(async move { store.check_and_mark(&fingerprint).await.unwrap() });
        }

        let mut new = 0;
        while let Some(claim) = set.join_next().await {
            if matches!(claim.unwrap(), Claim::New(_)) {
                new += 1;
            }
        }
        assert_eq!(new, 1);
    }
}

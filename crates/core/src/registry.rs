//! Persisted session registry.
//!
//! The on-disk store is the single source of truth for session metadata;
//! channels are a volatile cache owned by the manager and never persisted.
//! A missing or corrupt store file loads as "no sessions", never as a
//! fatal error.

use crate::status::{compute_status, is_stale};
use cgpu_protocol::{
    AcceleratorVariant, KernelState, RuntimeInfo, Session, SessionStats, SessionStatus,
    SessionView, Tier,
};
use cgpu_runtime::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

const STORE_SCHEMA_VERSION: u32 = 1;

/// Minimum identifier length accepted for prefix matching. Shorter
/// identifiers only ever match exactly.
pub const PREFIX_MIN_CHARS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreFile {
    schema: u32,
    #[serde(default)]
    sessions: HashMap<String, Session>,
}

impl Default for StoreFile {
    fn default() -> Self {
        Self {
            schema: STORE_SCHEMA_VERSION,
            sessions: HashMap::new(),
        }
    }
}

/// Registry of session records, persisted as JSON and bounded by the
/// account tier.
#[derive(Debug)]
pub struct SessionRegistry {
    path: PathBuf,
    tier: Tier,
    inner: Mutex<StoreFile>,
}

impl SessionRegistry {
    /// Open the registry at `path`, tolerating a missing or corrupt file.
    pub fn open(path: PathBuf, tier: Tier) -> Self {
        let file = fs::read_to_string(&path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();

        Self {
            path,
            tier,
            inner: Mutex::new(file),
        }
    }

    /// Default store location under the user config dir.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("cgpu")
            .join("sessions.json")
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn count(&self) -> usize {
        self.inner.lock().sessions.len()
    }

    /// Create a session bound to a freshly provisioned runtime and make it
    /// the active one. Fails with a resource-classified error once the
    /// tier's session budget is spent.
    pub fn create(
        &self,
        label: &str,
        variant: AcceleratorVariant,
        runtime: RuntimeInfo,
        now: u64,
    ) -> Result<Session> {
        let mut file = self.inner.lock();

        let limit = self.tier.max_sessions();
        if file.sessions.len() >= limit {
            return Err(Error::SessionLimit { limit });
        }

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            label: label.to_string(),
            variant,
            runtime,
            kernel_state: KernelState::Starting,
            is_active: true,
            created_at: now,
            last_used_at: now,
        };

        for existing in file.sessions.values_mut() {
            existing.is_active = false;
        }
        file.sessions.insert(session.id.clone(), session.clone());
        self.save(&file)?;

        tracing::info!(
            target: "cgpu.registry",
            id = %session.short_id(),
            label = %session.label,
            "session created"
        );
        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Session> {
        self.inner.lock().sessions.get(id).cloned()
    }

    /// Resolve an identifier: exact match first, then unique prefix for
    /// identifiers of at least [`PREFIX_MIN_CHARS`] characters. A prefix
    /// matching several records is an error naming all of them - never a
    /// silent pick.
    pub fn find(&self, query: &str) -> Result<Session> {
        let file = self.inner.lock();

        if let Some(session) = file.sessions.get(query) {
            return Ok(session.clone());
        }
        if query.chars().count() < PREFIX_MIN_CHARS {
            return Err(Error::NotFound(query.to_string()));
        }

        let mut matches: Vec<&Session> = file
            .sessions
            .values()
            .filter(|session| session.id.starts_with(query))
            .collect();

        match matches.len() {
            0 => Err(Error::NotFound(query.to_string())),
            1 => Ok(matches[0].clone()),
            _ => {
                matches.sort_by(|a, b| a.id.cmp(&b.id));
                Err(Error::Ambiguous {
                    prefix: query.to_string(),
                    matches: matches
                        .iter()
                        .map(|session| session.short_id().to_string())
                        .collect(),
                })
            }
        }
    }

    /// All sessions enriched with their computed status, oldest first.
    pub fn list(&self, now: u64) -> Vec<SessionView> {
        let file = self.inner.lock();
        let mut views: Vec<SessionView> = file
            .sessions
            .values()
            .map(|session| SessionView {
                status: compute_status(session, now),
                session: session.clone(),
            })
            .collect();
        views.sort_by(|a, b| {
            (a.session.created_at, &a.session.id).cmp(&(b.session.created_at, &b.session.id))
        });
        views
    }

    /// Apply a partial update to one session and persist it.
    pub fn update(&self, id: &str, apply: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut file = self.inner.lock();
        let session = file
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        apply(session);
        let updated = session.clone();
        self.save(&file)?;
        Ok(updated)
    }

    /// Remove the record. Local-only by contract: the remote runtime is not
    /// torn down here - callers needing that invoke the disconnect
    /// collaborator first, or accept an orphaned runtime.
    pub fn remove(&self, id: &str) -> Result<Session> {
        let mut file = self.inner.lock();
        let removed = file
            .sessions
            .remove(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.save(&file)?;
        Ok(removed)
    }

    /// Make `id` the active session and clear the flag everywhere else, as
    /// one atomic update.
    pub fn set_active(&self, id: &str, now: u64) -> Result<Session> {
        let mut file = self.inner.lock();
        if !file.sessions.contains_key(id) {
            return Err(Error::NotFound(id.to_string()));
        }
        for (session_id, session) in file.sessions.iter_mut() {
            session.is_active = session_id == id;
            if session.is_active {
                session.last_used_at = now;
            }
        }
        let updated = file.sessions[id].clone();
        self.save(&file)?;
        Ok(updated)
    }

    /// Remove every stale session. The returned set is exactly what was
    /// removed.
    pub fn clean_stale(&self, now: u64) -> Result<Vec<Session>> {
        let mut file = self.inner.lock();
        let stale_ids: Vec<String> = file
            .sessions
            .values()
            .filter(|session| is_stale(session, now))
            .map(|session| session.id.clone())
            .collect();

        let mut removed = Vec::with_capacity(stale_ids.len());
        for id in &stale_ids {
            if let Some(session) = file.sessions.remove(id) {
                removed.push(session);
            }
        }
        if !removed.is_empty() {
            self.save(&file)?;
        }
        removed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(removed)
    }

    /// Aggregate counts by computed status. Pure over stored records and
    /// the clock.
    pub fn stats(&self, now: u64) -> SessionStats {
        let file = self.inner.lock();
        let mut stats = SessionStats {
            total_sessions: file.sessions.len(),
            connected: 0,
            active: 0,
            stale: 0,
            unknown: 0,
            max_sessions: self.tier.max_sessions(),
        };
        for session in file.sessions.values() {
            match compute_status(session, now) {
                SessionStatus::Connected => stats.connected += 1,
                SessionStatus::Active => stats.active += 1,
                SessionStatus::Stale => stats.stale += 1,
                SessionStatus::Unknown => stats.unknown += 1,
            }
        }
        stats
    }

    fn save(&self, file: &StoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(file)?;
        fs::write(&self.path, json)?;

        // The store names runtimes and bearer accounts; keep it private.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            fs::set_permissions(&self.path, perms)?;
        }

        Ok(())
    }

    #[cfg(test)]
    fn insert_raw(&self, session: Session) {
        let mut file = self.inner.lock();
        file.sessions.insert(session.id.clone(), session);
        self.save(&file).unwrap();
    }
}

pub(crate) fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::STALE_GRACE_SECS;
    use cgpu_runtime::ErrorCategory;
    use tempfile::TempDir;

    const NOW: u64 = 1_700_000_000;

    fn runtime_info() -> RuntimeInfo {
        RuntimeInfo {
            accelerator: "T4".into(),
            endpoint: "wss://runtime.test/kernel".into(),
            expires_at: None,
        }
    }

    fn registry(dir: &TempDir, tier: Tier) -> SessionRegistry {
        SessionRegistry::open(dir.path().join("sessions.json"), tier)
    }

    fn raw_session(id: &str, kernel_state: KernelState) -> Session {
        Session {
            id: id.into(),
            label: id.into(),
            variant: AcceleratorVariant::Gpu,
            runtime: runtime_info(),
            kernel_state,
            is_active: false,
            created_at: NOW - 50,
            last_used_at: NOW - 10,
        }
    }

    #[test]
    fn create_enforces_tier_limit() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::Pro);

        registry
            .create("one", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();
        registry
            .create("two", AcceleratorVariant::Cpu, runtime_info(), NOW)
            .unwrap();

        let err = registry
            .create("three", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap_err();
        assert!(matches!(err, Error::SessionLimit { limit: 2 }));
        assert_eq!(err.category(), ErrorCategory::Resource);
        assert_eq!(registry.count(), 2);
    }

    #[test]
    fn create_activates_the_new_session() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);

        let first = registry
            .create("one", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();
        let second = registry
            .create("two", AcceleratorVariant::Gpu, runtime_info(), NOW + 1)
            .unwrap();

        assert!(second.is_active);
        assert!(!registry.get(&first.id).unwrap().is_active);
        let active = registry
            .list(NOW + 2)
            .into_iter()
            .filter(|view| view.session.is_active)
            .count();
        assert_eq!(active, 1);
    }

    #[test]
    fn short_identifiers_only_match_exactly() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        registry.insert_raw(raw_session("abcd1234-0000", KernelState::Idle));

        // Three characters: prefix matching is never attempted.
        let err = registry.find("abc").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        // Full id still resolves regardless of length rules.
        assert!(registry.find("abcd1234-0000").is_ok());
    }

    #[test]
    fn unique_prefix_resolves() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        registry.insert_raw(raw_session("abcd1234-0000", KernelState::Idle));
        registry.insert_raw(raw_session("wxyz9999-0000", KernelState::Idle));

        let found = registry.find("abcd").unwrap();
        assert_eq!(found.id, "abcd1234-0000");
    }

    #[test]
    fn ambiguous_prefix_names_all_matches() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        registry.insert_raw(raw_session("abcd1234-0000", KernelState::Idle));
        registry.insert_raw(raw_session("abcd5678-0000", KernelState::Idle));

        let err = registry.find("abcd").unwrap_err();
        match err {
            Error::Ambiguous { prefix, matches } => {
                assert_eq!(prefix, "abcd");
                assert_eq!(matches, vec!["abcd1234".to_string(), "abcd5678".to_string()]);
            }
            other => panic!("expected ambiguous error, got {other:?}"),
        }
    }

    #[test]
    fn switch_is_atomic_single_active() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        let a = registry
            .create("a", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();
        let b = registry
            .create("b", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();

        for target in [&a, &b, &a, &a, &b] {
            registry.set_active(&target.id, NOW + 5).unwrap();
            let active: Vec<String> = registry
                .list(NOW + 5)
                .into_iter()
                .filter(|view| view.session.is_active)
                .map(|view| view.session.id)
                .collect();
            assert_eq!(active, vec![target.id.clone()]);
        }

        // Switch refreshes last_used_at on the target.
        assert_eq!(registry.get(&b.id).unwrap().last_used_at, NOW + 5);
    }

    #[test]
    fn clean_stale_removes_exactly_the_stale_set() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        registry.insert_raw(raw_session("live-0001-aaaa", KernelState::Idle));
        registry.insert_raw(raw_session("dead-0001-aaaa", KernelState::Dead));
        let mut lapsed = raw_session("gone-0001-aaaa", KernelState::Disconnected);
        lapsed.last_used_at = NOW - STALE_GRACE_SECS - 60;
        registry.insert_raw(lapsed);

        let pre_clean_stale: Vec<String> = registry
            .list(NOW)
            .into_iter()
            .filter(|view| view.status == SessionStatus::Stale)
            .map(|view| view.session.id)
            .collect();

        let mut cleaned: Vec<String> = registry
            .clean_stale(NOW)
            .unwrap()
            .into_iter()
            .map(|session| session.id)
            .collect();
        cleaned.sort();
        let mut expected = pre_clean_stale;
        expected.sort();
        assert_eq!(cleaned, expected);
        assert_eq!(cleaned.len(), 2);

        let stats = registry.stats(NOW);
        assert_eq!(stats.stale, 0);
        assert_eq!(stats.total_sessions, 1);
    }

    #[test]
    fn stats_counts_by_computed_status() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::ProPlus);
        let mut active = raw_session("actv-0001-aaaa", KernelState::Idle);
        active.is_active = true;
        registry.insert_raw(active);
        registry.insert_raw(raw_session("conn-0001-aaaa", KernelState::Busy));
        registry.insert_raw(raw_session("unkn-0001-aaaa", KernelState::Unknown));

        let stats = registry.stats(NOW);
        assert_eq!(stats.total_sessions, 3);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.connected, 1);
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.stale, 0);
        assert_eq!(stats.max_sessions, 3);
    }

    #[test]
    fn store_round_trips_field_for_field() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");

        let written = {
            let registry = SessionRegistry::open(path.clone(), Tier::Pro);
            registry
                .create("persisted", AcceleratorVariant::Tpu, runtime_info(), NOW)
                .unwrap()
        };

        let reopened = SessionRegistry::open(path, Tier::Pro);
        let restored = reopened.get(&written.id).unwrap();
        assert_eq!(written, restored);
    }

    #[test]
    fn corrupt_store_loads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        fs::write(&path, "{ not json").unwrap();

        let registry = SessionRegistry::open(path, Tier::Free);
        assert_eq!(registry.count(), 0);
        // And it is usable from there.
        registry
            .create("fresh", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();
        assert_eq!(registry.count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn store_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.json");
        let registry = SessionRegistry::open(path.clone(), Tier::Free);
        registry
            .create("private", AcceleratorVariant::Gpu, runtime_info(), NOW)
            .unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn recovered_session_reads_connected_on_next_list() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir, Tier::Free);
        registry.insert_raw(raw_session("init-fail-0001", KernelState::InitFailed));

        let status = registry.list(NOW)[0].status;
        assert_eq!(status, SessionStatus::Stale);

        // A successful reconnect refreshes the stored kernel state; no
        // delete/recreate required.
        registry
            .update("init-fail-0001", |session| {
                session.kernel_state = KernelState::Idle;
            })
            .unwrap();
        let status = registry.list(NOW)[0].status;
        assert_eq!(status, SessionStatus::Connected);
    }
}

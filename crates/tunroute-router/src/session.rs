use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::tcp::TcpSession;
use crate::udp::UdpSession;
use crate::{FlowKey, RouterConfig};

/// State shared by TCP and UDP sessions: identity, activity clock and the close signal.
#[derive(Debug)]
pub(crate) struct SessionCore {
    key: FlowKey,
    id: u64,
    created_at: Instant,
    /// Milliseconds after `created_at` of the last packet in either direction.
    last_activity_ms: AtomicU64,
    closed: CancellationToken,
}

impl SessionCore {
    pub(crate) fn new(key: FlowKey, id: u64, parent: &CancellationToken) -> Self {
        Self {
            key,
            id,
            created_at: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            closed: parent.child_token(),
        }
    }

    pub(crate) fn key(&self) -> FlowKey {
        self.key
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn touch(&self) {
        let ms = self.created_at.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created_at
            + Duration::from_millis(self.last_activity_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub(crate) fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Session {
    Tcp(Arc<TcpSession>),
    Udp(Arc<UdpSession>),
}

impl Session {
    pub(crate) fn core(&self) -> &SessionCore {
        match self {
            Session::Tcp(s) => s.core(),
            Session::Udp(s) => s.core(),
        }
    }

    /// How long the session may stay idle before the sweeper evicts it.
    fn idle_limit(&self, cfg: &RouterConfig) -> Duration {
        match self {
            Session::Udp(_) => cfg.udp_idle_timeout,
            Session::Tcp(s) if s.in_handshake() => cfg.tcp_handshake_timeout,
            Session::Tcp(_) => cfg.tcp_idle_timeout,
        }
    }
}

/// Concurrent map from [`FlowKey`] to the live session for that flow.
///
/// Creation goes through [`SessionTable::get_or_try_create`], which holds the key's shard lock
/// while the session is built, so two racing packets for the same flow always end up sharing one
/// session.
#[derive(Debug, Default)]
pub(crate) struct SessionTable {
    map: DashMap<FlowKey, Session>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &FlowKey) -> Option<Session> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    pub(crate) fn contains(&self, key: &FlowKey) -> bool {
        self.map.contains_key(key)
    }

    /// Returns the session for `key`, building it with `create` if there is none. The flag is
    /// `true` when this call created it.
    ///
    /// `create` runs under the shard lock and must not touch the table.
    pub(crate) fn get_or_try_create<E>(
        &self,
        key: FlowKey,
        create: impl FnOnce(u64) -> Result<Session, E>,
    ) -> Result<(Session, bool), E> {
        match self.map.entry(key) {
            Entry::Occupied(entry) => Ok((entry.get().clone(), false)),
            Entry::Vacant(entry) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let session = create(id)?;
                entry.insert(session.clone());
                Ok((session, true))
            }
        }
    }

    /// Removes the entry for `key` only if it still belongs to session `id`; a newer session for
    /// the same flow is left alone.
    pub(crate) fn remove(&self, key: &FlowKey, id: u64) -> Option<Session> {
        self.map
            .remove_if(key, |_, session| session.core().id() == id)
            .map(|(_, session)| session)
    }

    pub(crate) fn len(&self) -> usize {
        self.map.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Removes and closes every session idle past its limit.
    pub(crate) fn evict_idle(&self, now: Instant, cfg: &RouterConfig) -> Vec<Session> {
        // Snapshot first so no shard lock is held while per-session state is inspected.
        let candidates: Vec<Session> = self.map.iter().map(|e| e.value().clone()).collect();
        let mut evicted = Vec::new();
        for session in candidates {
            let core = session.core();
            if core.idle_for(now) < session.idle_limit(cfg) {
                continue;
            }
            if let Some(removed) = self.remove(&core.key(), core.id()) {
                removed.core().close();
                evicted.push(removed);
            }
        }
        evicted
    }

    /// Removes and closes every session.
    pub(crate) fn close_all(&self) -> usize {
        let keys: Vec<FlowKey> = self.map.iter().map(|e| *e.key()).collect();
        let mut closed = 0;
        for key in keys {
            if let Some((_, session)) = self.map.remove(&key) {
                session.core().close();
                closed += 1;
            }
        }
        closed
    }
}

//! Process-wide map of session keys to their containers.
//!
//! Each key owns a slot with two async locks: the lifecycle lock guards
//! creation and teardown of the session container, and the exec lock keeps
//! commands against one session strictly sequential. A plain mutex-protected
//! summary mirrors the slot so enumeration never waits on either lock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

use crate::types::{SessionInfo, SessionStatus};

#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) status: SessionStatus,
    pub(crate) container_id: Option<String>,
}

#[derive(Debug)]
pub(crate) struct SessionSlot {
    key: String,
    container_name: String,
    lifecycle: AsyncMutex<SessionState>,
    exec: AsyncMutex<()>,
    summary: Mutex<SessionInfo>,
}

impl SessionSlot {
    fn new(key: &str, container_name: &str) -> Self {
        let now = SystemTime::now();
        Self {
            key: key.to_owned(),
            container_name: container_name.to_owned(),
            lifecycle: AsyncMutex::new(SessionState {
                status: SessionStatus::Starting,
                container_id: None,
            }),
            exec: AsyncMutex::new(()),
            summary: Mutex::new(SessionInfo {
                key: key.to_owned(),
                status: SessionStatus::Starting,
                container_id: None,
                container_name: container_name.to_owned(),
                created_at: now,
                last_used_at: now,
                executions: 0,
            }),
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn container_name(&self) -> &str {
        &self.container_name
    }

    pub(crate) async fn lock_lifecycle(&self) -> AsyncMutexGuard<'_, SessionState> {
        self.lifecycle.lock().await
    }

    pub(crate) async fn lock_exec(&self) -> AsyncMutexGuard<'_, ()> {
        self.exec.lock().await
    }

    /// Record a transition made while holding the lifecycle lock.
    pub(crate) fn transition(
        &self,
        state: &mut SessionState,
        status: SessionStatus,
        container_id: Option<String>,
    ) {
        state.status = status;
        state.container_id = container_id.clone();
        let mut summary = self.summary();
        summary.status = status;
        summary.container_id = container_id;
    }

    pub(crate) fn touch(&self) {
        let mut summary = self.summary();
        summary.last_used_at = SystemTime::now();
        summary.executions += 1;
    }

    pub(crate) fn info(&self) -> SessionInfo {
        self.summary().clone()
    }

    fn summary(&self) -> MutexGuard<'_, SessionInfo> {
        self.summary.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    slots: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.slots().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Point-in-time view of every registered session, sorted by key.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let slots: Vec<Arc<SessionSlot>> = self.slots().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = slots.iter().map(|slot| slot.info()).collect();
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    pub fn get(&self, key: &str) -> Option<SessionInfo> {
        self.slot(key).map(|slot| slot.info())
    }

    pub(crate) fn slot(&self, key: &str) -> Option<Arc<SessionSlot>> {
        self.slots().get(key).cloned()
    }

    pub(crate) fn get_or_insert(&self, key: &str, container_name: &str) -> Arc<SessionSlot> {
        self.slots()
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(SessionSlot::new(key, container_name)))
            .clone()
    }

    /// Remove `slot` only if it is still the registered slot for its key.
    pub(crate) fn remove_slot(&self, slot: &Arc<SessionSlot>) -> bool {
        let mut slots = self.slots();
        match slots.get(slot.key()) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                slots.remove(slot.key());
                true
            }
            _ => false,
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionSlot>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

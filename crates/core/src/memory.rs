//! In-memory CRM and queue used by tests across the workspace.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::crm::{ContactRecord, CrmClient, CrmError, FieldDescriptor};
use crate::queue::{key_for_id, Enqueued, Queue, QueueError, QueueItem, KEY_WIDTH};
use crate::types::WebhookPayload;

#[derive(Default)]
struct CrmState {
    contacts: BTreeMap<u64, ContactRecord>,
    segments: Vec<(u64, u64)>,
    fields: Vec<FieldDescriptor>,
    next_id: u64,
    calls: usize,
    failing: bool,
    rejecting: Option<u16>,
}

/// A CRM that keeps contacts in a map and follows the CRM's tag edit rules:
/// listed tags are attached, `-tag` entries are detached.
#[derive(Default)]
pub struct MemoryCrm {
    state: Mutex<CrmState>,
}

impl MemoryCrm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fields(aliases: &[&str]) -> Self {
        let crm = Self::new();
        crm.state().fields = aliases
            .iter()
            .map(|alias| FieldDescriptor {
                alias: alias.to_string(),
                label: alias.to_string(),
            })
            .collect();
        crm
    }

    /// Makes every following call fail until switched off.
    pub fn set_failing(&self, failing: bool) {
        self.state().failing = failing;
    }

    /// Makes every following call answer with `status` until cleared.
    pub fn set_rejecting(&self, status: Option<u16>) {
        self.state().rejecting = status;
    }

    pub fn calls(&self) -> usize {
        self.state().calls
    }

    pub fn insert(&self, mut contact: ContactRecord) -> u64 {
        let mut state = self.state();
        if contact.id == 0 {
            state.next_id += 1;
            contact.id = state.next_id;
        } else {
            state.next_id = state.next_id.max(contact.id);
        }
        let id = contact.id;
        state.contacts.insert(id, contact);
        id
    }

    pub fn contact(&self, id: u64) -> Option<ContactRecord> {
        self.state().contacts.get(&id).cloned()
    }

    pub fn contacts(&self) -> Vec<ContactRecord> {
        self.state().contacts.values().cloned().collect()
    }

    pub fn segments_of(&self, contact_id: u64) -> Vec<u64> {
        self.state()
            .segments
            .iter()
            .filter(|(_, contact)| *contact == contact_id)
            .map(|(segment, _)| *segment)
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, CrmState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_call(&self) -> Result<MutexGuard<'_, CrmState>, CrmError> {
        let mut state = self.state();
        state.calls += 1;
        if state.failing {
            return Err(CrmError::Transport("simulated outage".to_string()));
        }
        if let Some(status) = state.rejecting {
            return Err(CrmError::Status {
                status,
                body: "request rejected".to_string(),
            });
        }
        Ok(state)
    }
}

fn apply_fields(contact: &mut ContactRecord, fields: &Map<String, Value>) {
    for (key, value) in fields {
        if key != "tags" {
            contact.fields.insert(key.clone(), value.clone());
            continue;
        }
        let Some(tags) = value.as_array() else {
            continue;
        };
        for tag in tags.iter().filter_map(Value::as_str) {
            match tag.strip_prefix('-') {
                Some(removed) => contact.tags.retain(|t| t != removed),
                None => {
                    if !contact.tags.iter().any(|t| t == tag) {
                        contact.tags.push(tag.to_string());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CrmClient for MemoryCrm {
    async fn find_list(
        &self,
        query: &str,
        start: u32,
        limit: u32,
    ) -> Result<Vec<ContactRecord>, CrmError> {
        let state = self.begin_call()?;
        let matches = |contact: &&ContactRecord| match query.split_once(':') {
            Some((field, value)) => contact.field_str(field).as_deref() == Some(value),
            None => contact
                .field_str("email")
                .map(|email| email.eq_ignore_ascii_case(query))
                .unwrap_or(false),
        };
        Ok(state
            .contacts
            .values()
            .filter(matches)
            .skip(start as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn get(&self, id: u64) -> Result<Option<ContactRecord>, CrmError> {
        let state = self.begin_call()?;
        Ok(state.contacts.get(&id).cloned())
    }

    async fn create(&self, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError> {
        let mut state = self.begin_call()?;
        state.next_id += 1;
        let mut contact = ContactRecord {
            id: state.next_id,
            ..ContactRecord::default()
        };
        apply_fields(&mut contact, fields);
        let id = contact.id;
        state.contacts.insert(id, contact);
        Ok(Some(id))
    }

    async fn edit(&self, id: u64, fields: &Map<String, Value>) -> Result<Option<u64>, CrmError> {
        let mut state = self.begin_call()?;
        let contact = state.contacts.get_mut(&id).ok_or(CrmError::Status {
            status: 404,
            body: format!("contact {id} not found"),
        })?;
        apply_fields(contact, fields);
        Ok(Some(id))
    }

    async fn add_to_segment(&self, segment_id: u64, contact_id: u64) -> Result<(), CrmError> {
        let mut state = self.begin_call()?;
        if !state.segments.contains(&(segment_id, contact_id)) {
            state.segments.push((segment_id, contact_id));
        }
        Ok(())
    }

    async fn field_list(&self) -> Result<Vec<FieldDescriptor>, CrmError> {
        let state = self.begin_call()?;
        Ok(state.fields.clone())
    }
}

#[derive(Default)]
struct QueueState {
    items: BTreeMap<String, (Vec<u8>, u32)>,
    dead: Vec<(String, String)>,
    fallback_seq: u64,
}

/// Ordered in-memory queue with the same keying rules as the file store.
#[derive(Default)]
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    leased: Arc<AtomicBool>,
}

pub struct MemoryLease(Arc<AtomicBool>);

impl Drop for MemoryLease {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dead_letters(&self) -> Vec<(String, String)> {
        self.state().dead.clone()
    }

    /// Stores raw bytes under `key` as-is, bypassing validation.
    pub fn insert_raw(&self, key: &str, payload: &[u8]) {
        self.state()
            .items
            .insert(key.to_string(), (payload.to_vec(), 0));
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Queue for MemoryQueue {
    type Lease = MemoryLease;

    fn enqueue(&self, raw: &[u8]) -> Result<Enqueued, QueueError> {
        let payload: WebhookPayload = serde_json::from_slice(raw)?;
        let mut state = self.state();
        if let Some(key) = payload.event_id().as_deref().and_then(key_for_id) {
            if state.items.contains_key(&key) {
                return Ok(Enqueued::Duplicate(key));
            }
            state.items.insert(key.clone(), (raw.to_vec(), 0));
            return Ok(Enqueued::Stored(key));
        }
        state.fallback_seq += 1;
        let key = format!(
            "{:0width$}",
            10_000_000_000_000_000_000u64 + state.fallback_seq,
            width = KEY_WIDTH
        );
        state.items.insert(key.clone(), (raw.to_vec(), 0));
        Ok(Enqueued::Stored(key))
    }

    fn peek_oldest(&self) -> Result<Option<QueueItem>, QueueError> {
        Ok(self
            .state()
            .items
            .iter()
            .next()
            .map(|(key, (payload, attempts))| QueueItem {
                key: key.clone(),
                payload: payload.clone(),
                attempts: *attempts,
            }))
    }

    fn remove(&self, item: &QueueItem) -> Result<(), QueueError> {
        self.state().items.remove(&item.key);
        Ok(())
    }

    fn record_failure(&self, item: &QueueItem) -> Result<u32, QueueError> {
        let mut state = self.state();
        match state.items.get_mut(&item.key) {
            Some((_, attempts)) => {
                *attempts += 1;
                Ok(*attempts)
            }
            None => Ok(item.attempts + 1),
        }
    }

    fn dead_letter(&self, item: &QueueItem, reason: &str) -> Result<(), QueueError> {
        let mut state = self.state();
        state.items.remove(&item.key);
        state.dead.push((item.key.clone(), reason.to_string()));
        Ok(())
    }

    fn try_lease(&self) -> Result<Option<MemoryLease>, QueueError> {
        if self.leased.swap(true, Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(MemoryLease(self.leased.clone())))
    }

    fn pending(&self) -> Result<usize, QueueError> {
        Ok(self.state().items.len())
    }
}

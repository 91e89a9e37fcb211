use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;

use crate::types::SlotId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SlotError {
    #[error("slot {slot} is busy with job {job_id}")]
    Busy { slot: SlotId, job_id: String },
    #[error("unknown slot {0}")]
    Unknown(SlotId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotView {
    pub slot_id: SlotId,
    pub job_id: Option<String>,
}

/// `slot_id -> job_id | empty`. At most one job per slot.
#[derive(Debug)]
pub struct SlotTable {
    slots: Mutex<BTreeMap<SlotId, Option<String>>>,
    released: Notify,
}

impl SlotTable {
    pub fn new(slot_ids: impl IntoIterator<Item = SlotId>) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(slot_ids.into_iter().map(|id| (id, None)).collect()),
            released: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<SlotId, Option<String>>> {
        // The map is only ever assigned whole values, so a poisoned guard is still consistent.
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_free(&self, slot: SlotId) -> bool {
        matches!(self.lock().get(&slot), Some(None))
    }

    /// Reserve `slot` for `job_id`. The slot is released when the guard drops,
    /// whichever way the job ends.
    pub fn try_claim(self: &Arc<Self>, slot: SlotId, job_id: &str) -> Result<SlotGuard, SlotError> {
        let mut slots = self.lock();
        match slots.get_mut(&slot) {
            None => Err(SlotError::Unknown(slot)),
            Some(Some(current)) => Err(SlotError::Busy { slot, job_id: current.clone() }),
            Some(entry) => {
                *entry = Some(job_id.to_string());
                Ok(SlotGuard { table: Arc::clone(self), slot })
            }
        }
    }

    pub fn snapshot(&self) -> Vec<SlotView> {
        self.lock()
            .iter()
            .map(|(id, job)| SlotView { slot_id: *id, job_id: job.clone() })
            .collect()
    }

    pub fn busy_count(&self) -> usize {
        self.lock().values().filter(|j| j.is_some()).count()
    }

    /// Resolves once no slot holds a job.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.released.notified();
            if self.busy_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self, slot: SlotId) {
        if let Some(entry) = self.lock().get_mut(&slot) {
            *entry = None;
        }
        self.released.notify_waiters();
    }
}

#[derive(Debug)]
pub struct SlotGuard {
    table: Arc<SlotTable>,
    slot: SlotId,
}

impl SlotGuard {
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.table.release(self.slot);
    }
}

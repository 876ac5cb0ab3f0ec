use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
};

use crate::{
    accident::{AccidentRecord, AccidentStatus},
    config::{ConfigKind, RuntimeConfigEntry},
    engine::Engine,
    error::{Result, StoreError},
    event::{EventType, TxEvent},
    store::Store,
};

/// In-process engine used for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    events: Arc<RwLock<Vec<TxEvent>>>,
    accidents: Arc<RwLock<Vec<AccidentRecord>>>,
    next_accident_id: Arc<AtomicI64>,
    config: Arc<RwLock<HashMap<ConfigKind, RuntimeConfigEntry>>>,
}

impl Store {
    pub fn memory() -> Self {
        Store::new(Memory::default())
    }
}

#[async_trait]
impl Engine for Memory {
    async fn append(&self, event: TxEvent) -> Result<bool> {
        let mut events = self.events.write();

        if events.iter().any(|e| e.dedup_key() == event.dedup_key()) {
            return Ok(false);
        }

        events.push(event);

        Ok(true)
    }

    async fn query_incomplete(&self, older_than: DateTime<Utc>) -> Result<Vec<TxEvent>> {
        let events = self.events.read();

        let mut incomplete = events
            .iter()
            .filter(|e| e.event_type == EventType::TxStarted && e.created_at < older_than)
            .filter(|started| {
                !events.iter().any(|e| {
                    e.event_type.is_terminal()
                        && e.global_tx_id == started.global_tx_id
                        && e.local_tx_id == started.local_tx_id
                })
            })
            .cloned()
            .collect::<Vec<_>>();

        incomplete.sort_by_key(|e| e.created_at);

        Ok(incomplete)
    }

    async fn query_global(&self, global_tx_id: &str) -> Result<Vec<TxEvent>> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.global_tx_id == global_tx_id)
            .cloned()
            .collect())
    }

    async fn query_unconfirmed_globals(&self) -> Result<Vec<String>> {
        let events = self.events.read();
        let mut globals = Vec::new();

        for event in events.iter() {
            if event.event_type == EventType::SagaEnded || globals.contains(&event.global_tx_id) {
                continue;
            }

            let confirmed = events.iter().any(|e| {
                e.event_type == EventType::SagaEnded && e.global_tx_id == event.global_tx_id
            });

            if !confirmed {
                globals.push(event.global_tx_id.to_owned());
            }
        }

        Ok(globals)
    }

    async fn create_accident(&self, record: AccidentRecord) -> Result<AccidentRecord> {
        let mut record = record;
        record.id = self.next_accident_id.fetch_add(1, Ordering::SeqCst) + 1;

        self.accidents.write().push(record.clone());

        Ok(record)
    }

    async fn claim_accident(&self, id: i64) -> Result<bool> {
        let mut accidents = self.accidents.write();

        let Some(record) = accidents.iter_mut().find(|r| r.id == id) else {
            return Err(StoreError::AccidentNotFound(id));
        };

        if record.status != AccidentStatus::Init {
            return Ok(false);
        }

        record.status = AccidentStatus::Sending;

        Ok(true)
    }

    async fn complete_accident(&self, id: i64, status: AccidentStatus) -> Result<()> {
        let mut accidents = self.accidents.write();

        let Some(record) = accidents.iter_mut().find(|r| r.id == id) else {
            return Err(StoreError::AccidentNotFound(id));
        };

        if !record.status.can_advance_to(status) {
            return Err(StoreError::AccidentStatusRegression {
                id,
                from: record.status,
                to: status,
            });
        }

        record.status = status;
        record.completed_at = Some(Utc::now());

        Ok(())
    }

    async fn list_accidents(&self, status: Option<AccidentStatus>) -> Result<Vec<AccidentRecord>> {
        Ok(self
            .accidents
            .read()
            .iter()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn get_config(&self, kind: ConfigKind) -> Result<Option<RuntimeConfigEntry>> {
        Ok(self.config.read().get(&kind).cloned())
    }

    async fn set_config(&self, entry: RuntimeConfigEntry) -> Result<()> {
        self.config.write().insert(entry.kind, entry);

        Ok(())
    }
}

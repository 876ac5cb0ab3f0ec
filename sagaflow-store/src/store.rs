use chrono::{DateTime, Utc};

use crate::{
    accident::{AccidentRecord, AccidentStatus},
    config::{ConfigKind, RuntimeConfigEntry},
    engine::Engine,
    error::Result,
    event::{EventType, TxEvent},
};

/// Derived status of one local transaction, reconstructed from the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Running,
    Ended,
    Aborted,
    CompensationTriggered,
    Compensated,
}

impl TxStatus {
    /// The fold keeps the highest rank seen, which makes it independent of
    /// event arrival order: a late `TxEnded` never demotes a transaction the
    /// scanner already decided to compensate.
    fn rank(&self) -> u8 {
        match self {
            TxStatus::Running => 0,
            TxStatus::Ended | TxStatus::Aborted => 1,
            TxStatus::CompensationTriggered => 2,
            TxStatus::Compensated => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalTxState {
    pub local_tx_id: String,
    pub service_name: String,
    pub instance_id: String,
    pub status: TxStatus,
    /// The `TxStarted` event, kept around because it carries the
    /// compensation descriptors.
    pub started: Option<TxEvent>,
}

/// Event-sourced view of a whole saga. There is no stored status column;
/// applying the saga's events to a default value is the only way to get one.
#[derive(Debug, Clone, Default)]
pub struct GlobalStatus {
    pub global_tx_id: String,
    pub locals: Vec<LocalTxState>,
    pub confirmed: bool,
}

impl GlobalStatus {
    pub fn from_events(global_tx_id: impl Into<String>, events: &[TxEvent]) -> Self {
        let mut status = Self {
            global_tx_id: global_tx_id.into(),
            ..Self::default()
        };

        for event in events {
            status.apply(event);
        }

        status
    }

    pub fn apply(&mut self, event: &TxEvent) {
        if event.event_type == EventType::SagaEnded {
            self.confirmed = true;
            return;
        }

        let index = match self
            .locals
            .iter()
            .position(|l| l.local_tx_id == event.local_tx_id)
        {
            Some(index) => index,
            None => {
                self.locals.push(LocalTxState {
                    local_tx_id: event.local_tx_id.to_owned(),
                    service_name: event.service_name.to_owned(),
                    instance_id: event.instance_id.to_owned(),
                    status: TxStatus::Running,
                    started: None,
                });

                self.locals.len() - 1
            }
        };
        let local = &mut self.locals[index];

        let next = match event.event_type {
            EventType::TxStarted => {
                local.started = Some(event.clone());
                TxStatus::Running
            }
            EventType::TxEnded => TxStatus::Ended,
            EventType::TxAborted => TxStatus::Aborted,
            EventType::CompensationTriggered => TxStatus::CompensationTriggered,
            EventType::TxCompensated => TxStatus::Compensated,
            EventType::SagaEnded => return,
        };

        if next.rank() > local.status.rank() {
            local.status = next;
        }
    }

    /// True once every local transaction reached `Ended`, `Compensated` or
    /// `Aborted` (an aborted branch rolled back locally, nothing left to
    /// undo). Used to promote the saga to confirmed-complete.
    pub fn all_settled(&self) -> bool {
        !self.locals.is_empty()
            && self.locals.iter().all(|l| {
                matches!(
                    l.status,
                    TxStatus::Ended | TxStatus::Compensated | TxStatus::Aborted
                )
            })
    }

    pub fn any_aborted(&self) -> bool {
        self.locals.iter().any(|l| l.status == TxStatus::Aborted)
    }
}

/// Typed facade over an [`Engine`], shared by the scanner, the dispatcher and
/// the accident reporter.
#[derive(Clone)]
pub struct Store {
    engine: Box<dyn Engine>,
}

impl Store {
    pub fn new<E: Engine + 'static>(engine: E) -> Self {
        Self {
            engine: Box::new(engine),
        }
    }

    pub async fn append(&self, event: TxEvent) -> Result<bool> {
        self.engine.append(event).await
    }

    pub async fn query_incomplete(&self, older_than: DateTime<Utc>) -> Result<Vec<TxEvent>> {
        self.engine.query_incomplete(older_than).await
    }

    pub async fn global_status(&self, global_tx_id: &str) -> Result<GlobalStatus> {
        let events = self.engine.query_global(global_tx_id).await?;

        Ok(GlobalStatus::from_events(global_tx_id, &events))
    }

    pub async fn unconfirmed_globals(&self) -> Result<Vec<String>> {
        self.engine.query_unconfirmed_globals().await
    }

    /// Marks a local transaction compensation-triggered. The marker shares
    /// the event dedup key, so when several replicas race, exactly one caller
    /// gets `Ok(true)` and dispatches; the others must not.
    pub async fn trigger_compensation(&self, started: &TxEvent) -> Result<bool> {
        let marker = TxEvent::new(EventType::CompensationTriggered)
            .global_tx_id(&started.global_tx_id)
            .local_tx_id(&started.local_tx_id)
            .service_name(&started.service_name)
            .instance_id(&started.instance_id);

        self.engine.append(marker).await
    }

    /// Appends the dispatcher's "ended via compensation" terminal marker.
    pub async fn mark_compensated(&self, started: &TxEvent) -> Result<bool> {
        let marker = TxEvent::new(EventType::TxCompensated)
            .global_tx_id(&started.global_tx_id)
            .local_tx_id(&started.local_tx_id)
            .service_name(&started.service_name)
            .instance_id(&started.instance_id);

        self.engine.append(marker).await
    }

    /// Promotes a saga to confirmed-complete, consumed only by downstream
    /// archival.
    pub async fn confirm_saga(&self, global_tx_id: &str) -> Result<bool> {
        let marker = TxEvent::new(EventType::SagaEnded)
            .global_tx_id(global_tx_id)
            .local_tx_id(global_tx_id);

        self.engine.append(marker).await
    }

    pub async fn create_accident(&self, record: AccidentRecord) -> Result<AccidentRecord> {
        self.engine.create_accident(record).await
    }

    pub async fn claim_accident(&self, id: i64) -> Result<bool> {
        self.engine.claim_accident(id).await
    }

    pub async fn complete_accident(&self, id: i64, status: AccidentStatus) -> Result<()> {
        self.engine.complete_accident(id, status).await
    }

    pub async fn accidents(&self, status: Option<AccidentStatus>) -> Result<Vec<AccidentRecord>> {
        self.engine.list_accidents(status).await
    }

    pub async fn config(&self, kind: ConfigKind) -> Result<Option<RuntimeConfigEntry>> {
        self.engine.get_config(kind).await
    }

    pub async fn set_config(&self, entry: RuntimeConfigEntry) -> Result<()> {
        self.engine.set_config(entry).await
    }
}

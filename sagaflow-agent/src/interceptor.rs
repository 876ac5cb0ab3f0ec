use serde_json::Value;
use uuid::Uuid;

use sagaflow_store::{
    CompensationDescriptor, EventType, RetryPolicy, StartedPayload, StatementKind, TxEvent,
};

use crate::{
    analyzer::{analyze, AnalyzedStatement, SqlDialect},
    error::{AgentError, Result},
    executor::SqlExecutor,
    sender::EventSender,
    synthesizer::Synthesizer,
};

/// Identity and delivery settings of one participant service instance.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_name: String,
    pub instance_id: String,
    pub dialect: SqlDialect,
    pub delivery: RetryPolicy,
}

impl AgentConfig {
    pub fn new(
        service_name: impl Into<String>,
        instance_id: impl Into<String>,
        dialect: SqlDialect,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            instance_id: instance_id.into(),
            dialect,
            delivery: RetryPolicy::default(),
        }
    }

    pub fn delivery(mut self, policy: RetryPolicy) -> Self {
        self.delivery = policy;

        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Open,
    Committed,
    RolledBack,
}

/// Wraps one local business transaction of a saga.
///
/// Every mutating statement goes through [`LocalTransaction::execute`], which
/// synthesizes the compensating statement alongside the forward one. On
/// commit the buffered descriptors ride the `TxStarted` payload to the
/// coordinator, followed by `TxEnded`.
///
/// A statement the analyzer cannot classify, or whose compensation cannot be
/// keyed, still runs forward: the transaction is then flagged `uncovered` so
/// the coordinator knows an automatic rollback of this branch is partial.
pub struct LocalTransaction {
    config: AgentConfig,
    global_tx_id: String,
    local_tx_id: String,
    executor: Box<dyn SqlExecutor>,
    synthesizer: Synthesizer,
    descriptors: Vec<CompensationDescriptor>,
    uncovered: bool,
    state: TxState,
}

impl LocalTransaction {
    pub fn begin(
        config: AgentConfig,
        executor: Box<dyn SqlExecutor>,
        global_tx_id: impl Into<String>,
    ) -> Self {
        let synthesizer = Synthesizer::new(config.dialect);

        Self {
            config,
            global_tx_id: global_tx_id.into(),
            local_tx_id: Uuid::new_v4().to_string(),
            executor,
            synthesizer,
            descriptors: Vec::new(),
            uncovered: false,
            state: TxState::Open,
        }
    }

    pub fn global_tx_id(&self) -> &str {
        &self.global_tx_id
    }

    pub fn local_tx_id(&self) -> &str {
        &self.local_tx_id
    }

    pub fn descriptors(&self) -> &[CompensationDescriptor] {
        &self.descriptors
    }

    pub fn uncovered(&self) -> bool {
        self.uncovered
    }

    pub fn executor(&self) -> &dyn SqlExecutor {
        self.executor.as_ref()
    }

    /// Read within the guarded transaction. Never synthesizes anything.
    pub async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<sagaflow_store::Row>> {
        self.ensure_open()?;

        self.executor.query(sql, params).await
    }

    /// Runs a forward statement and buffers its compensation.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        self.ensure_open()?;

        let statement = match analyze(self.config.dialect, sql, params) {
            Ok(statement) => statement,
            Err(e @ (AgentError::UnsupportedStatement(_) | AgentError::SqlParse(_))) => {
                tracing::warn!(
                    global_tx_id = %self.global_tx_id,
                    local_tx_id = %self.local_tx_id,
                    error = %e,
                    "statement not covered by compensation, running forward only"
                );
                self.uncovered = true;

                return self.executor.execute(sql, params).await;
            }
            Err(e) => return Err(e),
        };

        match self
            .synthesizer
            .before_forward(&statement, self.executor.as_ref())
            .await
        {
            Ok(descriptors) => self.descriptors.extend(descriptors),
            Err(e @ (AgentError::KeyResolution(_) | AgentError::BeforeImageRead(_))) => {
                tracing::error!(
                    global_tx_id = %self.global_tx_id,
                    local_tx_id = %self.local_tx_id,
                    table = statement.table(),
                    error = %e,
                    "compensation synthesis failed, running forward uncovered"
                );
                self.uncovered = true;
            }
            Err(e) => return Err(e),
        }

        let affected = self.executor.execute(sql, params).await?;

        if statement.kind() == StatementKind::Insert {
            match self
                .synthesizer
                .after_insert(&statement, self.executor.as_ref())
                .await
            {
                Ok(descriptors) => self.descriptors.extend(descriptors),
                Err(e @ AgentError::KeyResolution(_)) => {
                    tracing::error!(
                        global_tx_id = %self.global_tx_id,
                        local_tx_id = %self.local_tx_id,
                        table = statement.table(),
                        error = %e,
                        "insert key unresolved, branch uncovered"
                    );
                    self.uncovered = true;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(affected)
    }

    /// Reports the finished branch to the coordinator. Compensating
    /// statements are applied in reverse buffer order, so the payload keeps
    /// them in execution order.
    ///
    /// A lost `TxStarted` fails the commit: without its descriptors the
    /// coordinator could never roll this branch back. A lost `TxEnded` is
    /// survivable, the timeout scanner recovers it, so it only errors after
    /// the retry budget.
    pub async fn commit(&mut self, sender: &dyn EventSender) -> Result<()> {
        self.ensure_open()?;

        let payload = StartedPayload {
            descriptors: std::mem::take(&mut self.descriptors),
            uncovered: self.uncovered,
        };

        let started = self.event(EventType::TxStarted).payload(&payload)?;
        self.descriptors = payload.descriptors;

        self.send_with_retry(sender, started).await?;

        self.state = TxState::Committed;

        self.send_with_retry(sender, self.event(EventType::TxEnded))
            .await
    }

    /// Reports a failed branch. The coordinator reacts by compensating the
    /// saga's already-ended siblings.
    pub async fn abort(&mut self, sender: &dyn EventSender, reason: &str) -> Result<()> {
        self.ensure_open()?;

        self.state = TxState::RolledBack;
        self.descriptors.clear();

        let aborted = self
            .event(EventType::TxAborted)
            .payload(serde_json::json!({ "reason": reason }))?;

        self.send_with_retry(sender, aborted).await
    }

    /// Discards the branch without telling the coordinator anything. Valid
    /// only before `TxStarted` went out: the business transaction rolled
    /// back, so there is nothing to compensate.
    pub fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;

        self.state = TxState::RolledBack;
        self.descriptors.clear();

        Ok(())
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state {
            TxState::Open => Ok(()),
            TxState::Committed => Err(AgentError::TxClosed("committed")),
            TxState::RolledBack => Err(AgentError::TxClosed("rolled back")),
        }
    }

    fn event(&self, event_type: EventType) -> TxEvent {
        TxEvent::new(event_type)
            .global_tx_id(&self.global_tx_id)
            .local_tx_id(&self.local_tx_id)
            .service_name(&self.config.service_name)
            .instance_id(&self.config.instance_id)
    }

    async fn send_with_retry(&self, sender: &dyn EventSender, event: TxEvent) -> Result<()> {
        let mut attempt = 0;

        loop {
            match sender.send(event.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    attempt += 1;

                    if attempt >= self.config.delivery.max_attempts {
                        return Err(AgentError::PermanentDelivery {
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }

                    tracing::warn!(
                        event_type = %event.event_type,
                        attempt,
                        error = %e,
                        "event delivery failed, backing off"
                    );
                    self.config.delivery.backoff(attempt - 1).await;
                }
            }
        }
    }
}

/// Applies one compensating statement through the participant's executor.
/// Called when the coordinator dispatches the descriptor back to us.
pub async fn apply_compensation(
    executor: &dyn SqlExecutor,
    descriptor: &CompensationDescriptor,
) -> Result<u64> {
    executor
        .execute(&descriptor.template, &descriptor.params)
        .await
}

impl std::fmt::Debug for LocalTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransaction")
            .field("global_tx_id", &self.global_tx_id)
            .field("local_tx_id", &self.local_tx_id)
            .field("descriptors", &self.descriptors.len())
            .field("uncovered", &self.uncovered)
            .field("state", &self.state)
            .finish()
    }
}

use std::time::Duration;

use tokio::time::{interval_at, Instant};

use sagaflow_store::{AccidentRecord, AccidentStatus, RetryPolicy, Store};

use crate::channel::{NotificationChannel, TOPIC_ACCIDENT};

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// Pushes accident records to the accident platform.
///
/// Records are created `Init`. The reporter claims one through the
/// conditional `Init → Sending` update, which is what keeps replicas from
/// double-reporting; the loser of that update simply moves on. After the
/// claim the record is published with bounded retry and completed
/// `Success` or `Fail`.
pub struct AccidentReporter {
    store: Store,
    notifier: Box<dyn NotificationChannel>,
    retry: RetryPolicy,
    interval: Duration,
}

impl AccidentReporter {
    pub fn new<N: NotificationChannel + 'static>(store: Store, notifier: N) -> Self {
        Self {
            store,
            notifier: Box::new(notifier),
            retry: RetryPolicy::default(),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;

        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;

        self
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("accident reporter started");

            let mut interval = interval_at(Instant::now() + self.interval, self.interval);

            loop {
                interval.tick().await;

                self.drain().await;
            }
        })
    }

    /// Reports every unclaimed accident once. Public for deterministic
    /// tests and embedders with their own scheduling.
    pub async fn drain(&self) {
        let records = match self.store.accidents(Some(AccidentStatus::Init)).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!("accident query failed: {e}");
                return;
            }
        };

        for record in records {
            self.report(record).await;
        }
    }

    async fn report(&self, record: AccidentRecord) {
        match self.store.claim_accident(record.id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(id = record.id, "accident claimed elsewhere, skip");
                return;
            }
            Err(e) => {
                tracing::error!(id = record.id, "accident claim failed: {e}");
                return;
            }
        }

        let payload = match record.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(id = record.id, "accident unserializable: {e}");
                self.complete(record.id, AccidentStatus::Fail).await;
                return;
            }
        };

        let mut attempt = 0;

        let outcome = loop {
            match self.notifier.publish(TOPIC_ACCIDENT, payload.clone()).await {
                Ok(()) => break AccidentStatus::Success,
                Err(e) => {
                    attempt += 1;

                    if attempt >= self.retry.max_attempts {
                        tracing::error!(
                            id = record.id,
                            global_tx_id = %record.global_tx_id,
                            attempts = attempt,
                            "accident publish exhausted retries: {e}"
                        );

                        break AccidentStatus::Fail;
                    }

                    tracing::warn!(id = record.id, attempt, "accident publish failed: {e}");
                    self.retry.backoff(attempt - 1).await;
                }
            }
        };

        self.complete(record.id, outcome).await;
    }

    async fn complete(&self, id: i64, status: AccidentStatus) {
        if let Err(e) = self.store.complete_accident(id, status).await {
            tracing::error!(id, "accident completion failed: {e}");
        }
    }
}

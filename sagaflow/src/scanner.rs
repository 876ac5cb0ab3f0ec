use std::{sync::Arc, time::Duration};

use chrono::Utc;
use serde_json::json;
use tokio::time::{interval_at, Instant};

use sagaflow_store::{AccidentKind, AccidentRecord, Store, TxEvent, TxStatus};

use crate::{
    channel::{NotificationChannel, TOPIC_SAGA_ENDED},
    config::SweepConfig,
    dispatcher::Dispatcher,
    leader::LeaderGuard,
};

const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Periodic sweep over the event log. Each tick, on the leader only:
///
/// 1. every local transaction open longer than SLA + exclusion window gets a
///    `CompensationTriggered` marker; the replica whose append wins hands the
///    descriptors to the dispatcher,
/// 2. sagas with an aborted branch get their already-ended siblings
///    compensated the same way,
/// 3. fully settled sagas are confirmed (`SagaEnded`) and announced
///    downstream.
///
/// Nothing in a sweep is allowed to take the loop down; failures are logged
/// and retried implicitly on the next tick.
pub struct Scanner {
    store: Store,
    dispatcher: Dispatcher,
    leader: Arc<dyn LeaderGuard>,
    notifier: Box<dyn NotificationChannel>,
    interval: Duration,
}

impl Scanner {
    pub fn new<N: NotificationChannel + 'static>(
        store: Store,
        dispatcher: Dispatcher,
        leader: Arc<dyn LeaderGuard>,
        notifier: N,
    ) -> Self {
        Self {
            store,
            dispatcher,
            leader,
            notifier: Box::new(notifier),
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;

        self
    }

    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!("event scanner started");

            let mut interval = interval_at(Instant::now() + self.interval, self.interval);

            loop {
                interval.tick().await;

                if !self.leader.is_leader() {
                    tracing::debug!("not leader, skip sweep");
                    continue;
                }

                self.sweep().await;
            }
        })
    }

    /// One full pass. Public so embedders and tests can drive sweeps
    /// deterministically instead of waiting out the interval.
    pub async fn sweep(&self) {
        let config = SweepConfig::poll(&self.store).await;

        if !config.compensation_enabled {
            tracing::debug!("compensation disabled, skip sweep");
            return;
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(config.cutoff_age())
                .unwrap_or_else(|_| chrono::Duration::seconds(70));

        match self.store.query_incomplete(cutoff).await {
            Ok(events) => {
                // One task per candidate, bounded by the dispatcher's
                // semaphore, so one branch's retry backoff never holds up
                // the other global transactions in the sweep.
                let triggers = events
                    .into_iter()
                    .map(|event| {
                        tokio::spawn(Self::trigger(
                            self.store.clone(),
                            self.dispatcher.clone(),
                            event,
                            "timeout",
                        ))
                    })
                    .collect::<Vec<_>>();

                for task in triggers {
                    if let Err(e) = task.await {
                        tracing::error!("trigger task failed: {e}");
                    }
                }
            }
            Err(e) => tracing::error!("timeout query failed: {e}"),
        }

        let globals = match self.store.unconfirmed_globals().await {
            Ok(globals) => globals,
            Err(e) => {
                tracing::error!("unconfirmed saga query failed: {e}");
                return;
            }
        };

        for global_tx_id in globals {
            self.settle(&global_tx_id).await;
        }
    }

    /// Conditional trigger: the `CompensationTriggered` append decides which
    /// replica dispatches. A transaction already triggered (here or by a
    /// peer) is left alone.
    async fn trigger(store: Store, dispatcher: Dispatcher, started: TxEvent, cause: &'static str) {
        match store.trigger_compensation(&started).await {
            Ok(true) => {
                tracing::info!(
                    global_tx_id = %started.global_tx_id,
                    local_tx_id = %started.local_tx_id,
                    cause,
                    "compensation triggered"
                );

                if let Err(e) = dispatcher.dispatch(&started).await {
                    tracing::error!(
                        global_tx_id = %started.global_tx_id,
                        local_tx_id = %started.local_tx_id,
                        "dispatch failed: {e}"
                    );
                }
            }
            Ok(false) => tracing::debug!(
                global_tx_id = %started.global_tx_id,
                local_tx_id = %started.local_tx_id,
                "already triggered, skip"
            ),
            Err(e) => tracing::error!("trigger append failed: {e}"),
        }
    }

    async fn settle(&self, global_tx_id: &str) {
        let status = match self.store.global_status(global_tx_id).await {
            Ok(status) => status,
            Err(e) => {
                tracing::error!(global_tx_id, "status fold failed: {e}");
                return;
            }
        };

        if status.confirmed {
            return;
        }

        if status.any_aborted() {
            let pending = status
                .locals
                .iter()
                .filter(|l| l.status == TxStatus::Ended)
                .collect::<Vec<_>>();

            if !pending.is_empty() {
                for local in pending {
                    match &local.started {
                        Some(started) => {
                            Self::trigger(
                                self.store.clone(),
                                self.dispatcher.clone(),
                                started.clone(),
                                "sibling aborted",
                            )
                            .await
                        }
                        // TxEnded arrived but TxStarted never did; without
                        // descriptors there is nothing to dispatch.
                        None => tracing::warn!(
                            global_tx_id,
                            local_tx_id = %local.local_tx_id,
                            "ended branch has no started event, cannot compensate"
                        ),
                    }
                }

                // Confirmation waits until the triggered siblings report
                // TxCompensated on a later sweep.
                return;
            }
        }

        if !status.all_settled() {
            return;
        }

        let compensated = status.any_aborted()
            || status
                .locals
                .iter()
                .any(|l| l.status == TxStatus::Compensated);

        match self.store.confirm_saga(global_tx_id).await {
            Ok(true) => self.announce(global_tx_id, compensated).await,
            Ok(false) => {}
            Err(e) => tracing::error!(global_tx_id, "saga confirmation failed: {e}"),
        }
    }

    /// Downstream saga-ended notification. A publish that keeps failing is
    /// recorded as a `SendMessageError` accident; the saga itself stays
    /// confirmed.
    async fn announce(&self, global_tx_id: &str, compensated: bool) {
        let payload = json!({
            "global_tx_id": global_tx_id,
            "compensated": compensated,
            "ended_at": Utc::now(),
        });

        if let Err(e) = self.notifier.publish(TOPIC_SAGA_ENDED, payload.clone()).await {
            tracing::error!(global_tx_id, "saga-ended publish failed: {e}");

            let record = AccidentRecord::new(AccidentKind::SendMessageError)
                .global_tx_id(global_tx_id)
                .remark(e.to_string())
                .biz_info(payload);

            match record {
                Ok(record) => {
                    if let Err(e) = self.store.create_accident(record).await {
                        tracing::error!("accident write failed: {e}");
                    }
                }
                Err(e) => tracing::error!("accident payload unserializable: {e}"),
            }
        }
    }
}

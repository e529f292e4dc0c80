use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use esm_broker::{BrokerError, DynBroker, OrderPlacement, OrderRequest, Session, Symbol};
use futures_util::{StreamExt, stream};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::compliance::{ComplianceValidator, EffectiveOrder, OrderIntent, ValidationError};
use crate::notify::{BatchCounts, Event, NotificationDispatcher};
use crate::token::TokenManager;

#[derive(Debug, Clone)]
pub struct ExecutionConfig {
    pub max_attempts: usize,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
    pub max_concurrency: usize,
    pub call_timeout: Duration,
    pub margin_check: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
            max_concurrency: 4,
            call_timeout: Duration::from_secs(10),
            margin_check: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Placed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("{0}")]
    BrokerRejected(String),
    #[error("{0}")]
    TransientNetwork(String),
    #[error("{0}")]
    AuthRejected(String),
    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Decimal, available: Decimal },
    #[error("session lost")]
    SessionLost,
}

impl From<BrokerError> for OrderError {
    fn from(error: BrokerError) -> Self {
        match error {
            BrokerError::Rejected { message } => Self::BrokerRejected(message),
            error if error.is_auth_invalid() => Self::AuthRejected(error.to_string()),
            error if error.is_retryable() => Self::TransientNetwork(error.to_string()),
            error => Self::BrokerRejected(error.to_string()),
        }
    }
}

/// Terminal result for one active intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderOutcome {
    pub intent: OrderIntent,
    /// Present once validation passed.
    pub effective: Option<EffectiveOrder>,
    pub status: OrderStatus,
    pub broker_order_id: Option<String>,
    pub error: Option<OrderError>,
    /// Placement calls made; at least one even when the order never reached
    /// the broker.
    pub attempts: u32,
}

impl OrderOutcome {
    fn placed(
        intent: &OrderIntent,
        effective: EffectiveOrder,
        placement: OrderPlacement,
        attempts: u32,
    ) -> Self {
        Self {
            intent: intent.clone(),
            effective: Some(effective),
            status: OrderStatus::Placed,
            broker_order_id: Some(placement.order_id),
            error: None,
            attempts: attempts.max(1),
        }
    }

    fn failed(
        intent: &OrderIntent,
        effective: Option<EffectiveOrder>,
        error: OrderError,
        attempts: u32,
    ) -> Self {
        Self {
            intent: intent.clone(),
            effective,
            status: OrderStatus::Failed,
            broker_order_id: None,
            error: Some(error),
            attempts: attempts.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionBatch {
    /// One outcome per active intent, in input order.
    pub outcomes: Vec<OrderOutcome>,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionBatch {
    pub fn counts(&self) -> BatchCounts {
        let placed = self
            .outcomes
            .iter()
            .filter(|outcome| outcome.status == OrderStatus::Placed)
            .count();

        BatchCounts {
            total: self.outcomes.len() + self.skipped,
            placed,
            failed: self.outcomes.len() - placed,
            skipped: self.skipped,
        }
    }
}

#[derive(Debug)]
pub struct ExecutionEngine {
    broker: DynBroker,
    tokens: Arc<TokenManager>,
    validator: ComplianceValidator,
    notifications: NotificationDispatcher,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(
        broker: DynBroker,
        tokens: Arc<TokenManager>,
        validator: ComplianceValidator,
        notifications: NotificationDispatcher,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            broker,
            tokens,
            validator,
            notifications,
            config,
        }
    }

    /// Validates and places every active intent. Inactive intents are
    /// skipped without any broker call.
    pub async fn execute_batch(&self, intents: &[OrderIntent]) -> ExecutionBatch {
        let started_at = Utc::now();
        let active: Vec<OrderIntent> = intents
            .iter()
            .filter(|intent| intent.is_active)
            .cloned()
            .collect();
        let skipped = intents.len() - active.len();

        info!(
            active = active.len(),
            skipped,
            max_concurrency = self.config.max_concurrency,
            "Executing order batch"
        );

        let session_lost = AtomicBool::new(false);
        let mut indexed: Vec<(usize, OrderOutcome)> = stream::iter(active.into_iter().enumerate())
            .map(|(index, intent)| {
                let session_lost = &session_lost;
                async move { (index, self.process(&intent, session_lost).await) }
            })
            .buffer_unordered(self.config.max_concurrency.max(1))
            .collect()
            .await;
        indexed.sort_by_key(|(index, _)| *index);

        let batch = ExecutionBatch {
            outcomes: indexed.into_iter().map(|(_, outcome)| outcome).collect(),
            skipped,
            started_at,
            finished_at: Utc::now(),
        };

        let counts = batch.counts();
        info!(
            placed = counts.placed,
            failed = counts.failed,
            skipped = counts.skipped,
            elapsed_ms = (batch.finished_at - batch.started_at).num_milliseconds(),
            "Order batch finished"
        );
        self.notifications.emit(Event::BatchCompleted { counts });

        batch
    }

    async fn process(&self, intent: &OrderIntent, session_lost: &AtomicBool) -> OrderOutcome {
        let outcome = self.place_intent(intent, session_lost).await;

        match (&outcome.broker_order_id, &outcome.error) {
            (Some(order_id), _) => {
                self.notifications.emit(Event::OrderPlaced {
                    symbol: intent.symbol.clone(),
                    broker_order_id: order_id.clone(),
                });
            }
            (None, Some(error)) => {
                warn!(symbol = %intent.symbol, attempts = outcome.attempts, %error, "Order failed");
                self.notifications.emit(Event::OrderFailed {
                    symbol: intent.symbol.clone(),
                    reason: error.to_string(),
                });
            }
            (None, None) => {}
        }

        outcome
    }

    async fn place_intent(&self, intent: &OrderIntent, session_lost: &AtomicBool) -> OrderOutcome {
        if session_lost.load(Ordering::SeqCst) {
            return OrderOutcome::failed(intent, None, OrderError::SessionLost, 0);
        }

        let Some(mut session) = self.tokens.current_session().await else {
            return OrderOutcome::failed(intent, None, OrderError::SessionLost, 0);
        };

        let mut recovered = false;
        let reference_price = if self.validator.needs_reference_price(intent) {
            match self.reference_price(&session, intent).await {
                Ok(price) => price,
                Err(error) if error.is_auth_invalid() => {
                    recovered = true;
                    let Some(fresh) = self.recover_session(&session, session_lost).await else {
                        return OrderOutcome::failed(intent, None, OrderError::SessionLost, 0);
                    };
                    session = fresh;
                    self.reference_price(&session, intent)
                        .await
                        .unwrap_or_else(|error| {
                            warn!(symbol = %intent.symbol, %error, "Could not fetch reference price");
                            None
                        })
                }
                Err(error) => {
                    warn!(symbol = %intent.symbol, %error, "Could not fetch reference price");
                    None
                }
            }
        } else {
            None
        };

        let effective = match self.validator.validate(intent, reference_price) {
            Ok(effective) => effective,
            Err(error) => return OrderOutcome::failed(intent, None, error.into(), 0),
        };
        let request = effective.to_request();

        if self.config.margin_check {
            if let Some(error) = self.check_margin(&session, &request).await {
                return OrderOutcome::failed(intent, Some(effective), error, 0);
            }
        }

        let attempts = AtomicU32::new(0);

        loop {
            let result = self.place_with_retry(&session, &request, &attempts).await;
            let made = attempts.load(Ordering::SeqCst);

            let error = match result {
                Ok(placement) => {
                    info!(
                        symbol = %request.symbol,
                        order_id = %placement.order_id,
                        attempts = made,
                        "Order placed"
                    );
                    return OrderOutcome::placed(intent, effective, placement, made);
                }
                Err(error) => error,
            };

            if !error.is_auth_invalid() || recovered {
                return OrderOutcome::failed(intent, Some(effective), error.into(), made);
            }

            recovered = true;
            let Some(fresh) = self.recover_session(&session, session_lost).await else {
                return OrderOutcome::failed(intent, Some(effective), OrderError::SessionLost, made);
            };
            info!(symbol = %request.symbol, "Session recovered, resuming placement");
            session = fresh;
        }
    }

    /// Re-acquires a session the broker rejected. A failed recovery marks
    /// the batch session as lost so later orders fail fast.
    async fn recover_session(&self, stale: &Session, session_lost: &AtomicBool) -> Option<Session> {
        if session_lost.load(Ordering::SeqCst) {
            return None;
        }

        match self.tokens.recover(stale).await {
            Ok(fresh) => Some(fresh),
            Err(token_error) => {
                error!(%token_error, "Could not recover session, abandoning remaining orders");
                session_lost.store(true, Ordering::SeqCst);
                None
            }
        }
    }

    async fn place_with_retry(
        &self,
        session: &Session,
        request: &OrderRequest,
        attempts: &AtomicU32,
    ) -> Result<OrderPlacement, BrokerError> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.backoff)
            .with_factor(2.0)
            .with_max_times(self.config.max_attempts.saturating_sub(1));

        (|| async {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(symbol = %request.symbol, attempt, "Submitting order");

            tokio::time::timeout(self.config.call_timeout, self.broker.place_order(session, request))
                .await
                .map_err(|_| BrokerError::Transient {
                    message: format!(
                        "order placement timed out after {:?}",
                        self.config.call_timeout
                    ),
                })?
        })
        .retry(backoff)
        .when(BrokerError::is_retryable)
        .notify(|error, delay| {
            warn!(symbol = %request.symbol, %error, ?delay, "Order placement failed, retrying");
        })
        .await
    }

    /// Last traded price for a restricted market order. Transient failures
    /// are retried; an unparseable symbol yields no price.
    async fn reference_price(
        &self,
        session: &Session,
        intent: &OrderIntent,
    ) -> Result<Option<Decimal>, BrokerError> {
        let Ok(symbol) = intent.symbol.parse::<Symbol>() else {
            return Ok(None);
        };
        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.backoff)
            .with_factor(2.0)
            .with_max_times(self.config.max_attempts.saturating_sub(1));

        let price = (|| async {
            tokio::time::timeout(self.config.call_timeout, self.broker.last_price(session, &symbol))
                .await
                .map_err(|_| BrokerError::Transient {
                    message: format!(
                        "reference price request timed out after {:?}",
                        self.config.call_timeout
                    ),
                })?
        })
        .retry(backoff)
        .when(BrokerError::is_retryable)
        .notify(|error, delay| {
            warn!(%symbol, %error, ?delay, "Reference price lookup failed, retrying");
        })
        .await?;

        debug!(%symbol, %price, "Fetched reference price");
        Ok(Some(price))
    }

    /// Returns an error only when both margin figures are known and
    /// insufficient. A failed margin lookup never blocks the order.
    async fn check_margin(&self, session: &Session, request: &OrderRequest) -> Option<OrderError> {
        let required = match self.broker.required_margin(session, request).await {
            Ok(required) => required,
            Err(error) => {
                warn!(symbol = %request.symbol, %error, "Margin lookup failed, placing anyway");
                return None;
            }
        };

        let available = match self.broker.available_cash(session).await {
            Ok(available) => available,
            Err(error) => {
                warn!(%error, "Available cash lookup failed, placing anyway");
                return None;
            }
        };

        info!(symbol = %request.symbol, %required, %available, "Margin check");
        (available < required).then_some(OrderError::InsufficientMargin {
            required,
            available,
        })
    }
}

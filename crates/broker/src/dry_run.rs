use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use tracing::warn;

use crate::{
    ApiCredentials, Broker, BrokerError, OrderPlacement, OrderRequest, Session, SessionGrant,
    SupportedBroker, Symbol, UserProfile,
};

/// Broker for dry-run mode that logs operations without reaching the exchange
#[derive(Debug, Clone)]
pub struct DryRunBroker {
    order_counter: Arc<AtomicU64>,
}

impl DryRunBroker {
    pub fn new() -> Self {
        Self {
            order_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    fn generate_order_id(&self) -> String {
        let id = self.order_counter.fetch_add(1, Ordering::SeqCst);
        format!("DRY_RUN_{id}")
    }
}

impl Default for DryRunBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for DryRunBroker {
    fn login_url(&self, api_key: &str) -> String {
        format!("https://dry-run.invalid/connect/login?v=3&api_key={api_key}")
    }

    async fn profile(&self, _session: &Session) -> Result<UserProfile, BrokerError> {
        warn!("[DRY-RUN] Session check - every session is valid in dry-run mode");
        Ok(UserProfile {
            user_id: "DRYRUN".to_string(),
            user_name: "Dry Run".to_string(),
        })
    }

    async fn generate_session(
        &self,
        _credentials: &ApiCredentials,
        request_token: &str,
    ) -> Result<SessionGrant, BrokerError> {
        warn!("[DRY-RUN] Exchanging request token without contacting the broker");
        Ok(SessionGrant {
            user_id: "DRYRUN".to_string(),
            access_token: format!("dry_run_{request_token}"),
        })
    }

    async fn place_order(
        &self,
        _session: &Session,
        order: &OrderRequest,
    ) -> Result<OrderPlacement, BrokerError> {
        let order_id = self.generate_order_id();

        warn!(
            "[DRY-RUN] Would place order: {} {} x {} {} price={:?} (order_id: {})",
            order.transaction_type,
            order.quantity,
            order.symbol,
            order.order_type,
            order.price,
            order_id
        );

        Ok(OrderPlacement {
            order_id,
            symbol: order.symbol.clone(),
            placed_at: chrono::Utc::now(),
        })
    }

    async fn last_price(
        &self,
        _session: &Session,
        symbol: &Symbol,
    ) -> Result<Decimal, BrokerError> {
        warn!("[DRY-RUN] No market data for {symbol}");
        Err(BrokerError::Rejected {
            message: format!("no reference price for {symbol} in dry-run mode"),
        })
    }

    async fn required_margin(
        &self,
        _session: &Session,
        _order: &OrderRequest,
    ) -> Result<Decimal, BrokerError> {
        Ok(Decimal::ZERO)
    }

    async fn available_cash(&self, _session: &Session) -> Result<Decimal, BrokerError> {
        Ok(Decimal::MAX)
    }

    fn to_supported_broker(&self) -> SupportedBroker {
        SupportedBroker::DryRun
    }
}

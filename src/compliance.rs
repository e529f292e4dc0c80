use esm_broker::{
    InvalidSymbolError, OrderRequest, OrderType, ProductType, Symbol, TransactionType,
};
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashSet;
use std::str::FromStr;

/// Minimum price increment for NSE/BSE equities.
pub const TICK_SIZE: Decimal = Decimal::from_parts(5, 0, 0, false, 2);

/// An order row as configured by the user, before any checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub symbol: String,
    pub quantity: i64,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub is_active: bool,
}

/// An intent that passed validation and is ready for placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveOrder {
    pub symbol: Symbol,
    pub quantity: u32,
    pub order_type: OrderType,
    pub limit_price: Option<Decimal>,
    pub product: ProductType,
}

impl EffectiveOrder {
    pub fn to_request(&self) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            transaction_type: TransactionType::Buy,
            quantity: self.quantity,
            order_type: self.order_type,
            price: self.limit_price,
            product: self.product,
        }
    }

    pub fn as_intent(&self) -> OrderIntent {
        OrderIntent {
            symbol: self.symbol.to_string(),
            quantity: i64::from(self.quantity),
            order_type: self.order_type,
            limit_price: self.limit_price,
            is_active: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Quantity must be positive, got {0}")]
    NonPositiveQuantity(i64),
    #[error("Quantity {0} exceeds the largest order the broker accepts")]
    QuantityTooLarge(i64),
    #[error("LIMIT order for {symbol} needs a positive limit price")]
    MissingLimitPrice { symbol: String },
    #[error(transparent)]
    InvalidSymbol(#[from] InvalidSymbolError),
    #[error("Market orders are not allowed for {symbol} and no reference price is available")]
    MissingReferencePrice { symbol: String },
}

/// Which instruments refuse MARKET orders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketOrderRestriction {
    None,
    All,
    Symbols(HashSet<Symbol>),
}

impl MarketOrderRestriction {
    pub fn restricts(&self, symbol: &Symbol) -> bool {
        match self {
            Self::None => false,
            Self::All => true,
            Self::Symbols(symbols) => symbols.contains(symbol),
        }
    }
}

impl FromStr for MarketOrderRestriction {
    type Err = InvalidSymbolError;

    /// `all`, `none`, or a comma separated list of qualified symbols.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(Self::All),
            "none" | "" => Ok(Self::None),
            _ => s
                .split(',')
                .filter(|part| !part.trim().is_empty())
                .map(str::parse)
                .collect::<Result<HashSet<Symbol>, _>>()
                .map(Self::Symbols),
        }
    }
}

/// Rounds to the nearest tick, halves away from zero.
pub fn round_to_tick(price: Decimal) -> Decimal {
    (price / TICK_SIZE).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        * TICK_SIZE
}

/// Normalizes intents into orders the broker accepts for ESM instruments:
/// always delivery product, and never MARKET where the exchange forbids it.
#[derive(Debug, Clone)]
pub struct ComplianceValidator {
    restriction: MarketOrderRestriction,
}

impl ComplianceValidator {
    pub fn new(restriction: MarketOrderRestriction) -> Self {
        Self { restriction }
    }

    /// True when `validate` will need a reference price for this intent.
    /// Intents that fail validation for other reasons report false.
    pub fn needs_reference_price(&self, intent: &OrderIntent) -> bool {
        intent.order_type == OrderType::Market
            && intent
                .symbol
                .parse::<Symbol>()
                .is_ok_and(|symbol| self.restriction.restricts(&symbol))
    }

    pub fn validate(
        &self,
        intent: &OrderIntent,
        reference_price: Option<Decimal>,
    ) -> Result<EffectiveOrder, ValidationError> {
        if intent.quantity <= 0 {
            return Err(ValidationError::NonPositiveQuantity(intent.quantity));
        }
        let quantity = u32::try_from(intent.quantity)
            .map_err(|_| ValidationError::QuantityTooLarge(intent.quantity))?;

        let symbol: Symbol = intent.symbol.parse()?;

        let (order_type, limit_price) = match intent.order_type {
            OrderType::Limit => {
                let price = intent
                    .limit_price
                    .filter(|price| price.is_sign_positive() && !price.is_zero())
                    .ok_or_else(|| ValidationError::MissingLimitPrice {
                        symbol: symbol.to_string(),
                    })?;
                (OrderType::Limit, Some(price))
            }
            OrderType::Market if self.restriction.restricts(&symbol) => {
                let price = reference_price
                    .map(round_to_tick)
                    .filter(|price| price.is_sign_positive() && !price.is_zero())
                    .ok_or_else(|| ValidationError::MissingReferencePrice {
                        symbol: symbol.to_string(),
                    })?;
                (OrderType::Limit, Some(price))
            }
            OrderType::Market => (OrderType::Market, None),
        };

        Ok(EffectiveOrder {
            symbol,
            quantity,
            order_type,
            limit_price,
            product: ProductType::Cnc,
        })
    }
}

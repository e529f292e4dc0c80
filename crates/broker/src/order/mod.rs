use rust_decimal::Decimal;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Exchange {
    Nse,
    Bse,
}

impl Exchange {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Nse => "NSE",
            Self::Bse => "BSE",
        }
    }
}

impl Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidSymbolError {
    #[error("Symbol '{0}' is not exchange-qualified (expected EXCHANGE:SYMBOL)")]
    Unqualified(String),
    #[error("Unknown exchange '{exchange}' in symbol '{symbol}'")]
    UnknownExchange { exchange: String, symbol: String },
    #[error("Invalid trading symbol '{0}'")]
    InvalidTradingSymbol(String),
}

/// Exchange-qualified instrument, e.g. `NSE:INFY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Symbol {
    exchange: Exchange,
    tradingsymbol: String,
}

impl Symbol {
    pub const fn exchange(&self) -> Exchange {
        self.exchange
    }

    pub fn tradingsymbol(&self) -> &str {
        &self.tradingsymbol
    }
}

impl FromStr for Symbol {
    type Err = InvalidSymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let Some((exchange, tradingsymbol)) = trimmed.split_once(':') else {
            return Err(InvalidSymbolError::Unqualified(trimmed.to_string()));
        };

        let exchange = match exchange.trim().to_ascii_uppercase().as_str() {
            "NSE" => Exchange::Nse,
            "BSE" => Exchange::Bse,
            "" => return Err(InvalidSymbolError::Unqualified(trimmed.to_string())),
            other => {
                return Err(InvalidSymbolError::UnknownExchange {
                    exchange: other.to_string(),
                    symbol: trimmed.to_string(),
                });
            }
        };

        let tradingsymbol = tradingsymbol.trim().to_ascii_uppercase();
        // NSE symbols carry `&` and `-` (M&M, BAJAJ-AUTO); nothing else is legal.
        let valid = !tradingsymbol.is_empty()
            && tradingsymbol
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '&' | '-' | '_'));
        if !valid {
            return Err(InvalidSymbolError::InvalidTradingSymbol(trimmed.to_string()));
        }

        Ok(Self {
            exchange,
            tradingsymbol,
        })
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.exchange, self.tradingsymbol)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
        }
    }
}

impl Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid order type: '{0}'. Expected one of: MARKET, LIMIT")]
pub struct InvalidOrderTypeError(String);

impl FromStr for OrderType {
    type Err = InvalidOrderTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MARKET" => Ok(Self::Market),
            "LIMIT" => Ok(Self::Limit),
            _ => Err(InvalidOrderTypeError(s.to_string())),
        }
    }
}

/// Kite product codes.
///
/// Instruments under the enhanced surveillance measure are trade-to-trade and
/// only accept `CNC` (cash and carry, delivery).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProductType {
    Cnc,
    Mis,
    Nrml,
}

impl ProductType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cnc => "CNC",
            Self::Mis => "MIS",
            Self::Nrml => "NRML",
        }
    }
}

impl Display for ProductType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    Buy,
    Sell,
}

impl TransactionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fully specified regular-variety day order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub transaction_type: TransactionType,
    pub quantity: u32,
    pub order_type: OrderType,
    pub price: Option<Decimal>,
    pub product: ProductType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPlacement {
    pub order_id: String,
    pub symbol: Symbol,
    pub placed_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_parse_qualified() {
        let symbol: Symbol = "NSE:INFY".parse().unwrap();
        assert_eq!(symbol.exchange(), Exchange::Nse);
        assert_eq!(symbol.tradingsymbol(), "INFY");
        assert_eq!(symbol.to_string(), "NSE:INFY");
    }

    #[test]
    fn test_symbol_parse_normalizes_case_and_whitespace() {
        let symbol: Symbol = " bse:m&m ".parse().unwrap();
        assert_eq!(symbol.exchange(), Exchange::Bse);
        assert_eq!(symbol.to_string(), "BSE:M&M");

        let reparsed: Symbol = symbol.to_string().parse().unwrap();
        assert_eq!(reparsed, symbol);
    }

    #[test]
    fn test_symbol_parse_hyphenated() {
        let symbol: Symbol = "NSE:BAJAJ-AUTO".parse().unwrap();
        assert_eq!(symbol.tradingsymbol(), "BAJAJ-AUTO");
    }

    #[test]
    fn test_symbol_parse_unqualified() {
        assert!(matches!(
            "INFY".parse::<Symbol>().unwrap_err(),
            InvalidSymbolError::Unqualified(s) if s == "INFY"
        ));
        assert!(matches!(
            ":INFY".parse::<Symbol>().unwrap_err(),
            InvalidSymbolError::Unqualified(_)
        ));
    }

    #[test]
    fn test_symbol_parse_unknown_exchange() {
        assert!(matches!(
            "NYSE:IBM".parse::<Symbol>().unwrap_err(),
            InvalidSymbolError::UnknownExchange { exchange, .. } if exchange == "NYSE"
        ));
    }

    #[test]
    fn test_symbol_parse_invalid_tradingsymbol() {
        assert!(matches!(
            "NSE:".parse::<Symbol>().unwrap_err(),
            InvalidSymbolError::InvalidTradingSymbol(_)
        ));
        assert!(matches!(
            "NSE:IN FY".parse::<Symbol>().unwrap_err(),
            InvalidSymbolError::InvalidTradingSymbol(_)
        ));
    }

    #[test]
    fn test_order_type_from_str() {
        assert_eq!("MARKET".parse::<OrderType>().unwrap(), OrderType::Market);
        assert_eq!(" limit ".parse::<OrderType>().unwrap(), OrderType::Limit);
        assert!("STOP".parse::<OrderType>().is_err());
    }

    #[test]
    fn test_kite_codes() {
        assert_eq!(ProductType::Cnc.as_str(), "CNC");
        assert_eq!(TransactionType::Buy.as_str(), "BUY");
        assert_eq!(OrderType::Limit.to_string(), "LIMIT");
        assert_eq!(Exchange::Bse.to_string(), "BSE");
    }
}

//! Loads the order list from a CSV file.
//!
//! Expected header: `trading_symbol,quantity,order_type,limit_price,is_active`.
//! Column order does not matter and extra columns are ignored.

use esm_broker::OrderType;
use esm_broker::order::InvalidOrderTypeError;
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

use crate::compliance::OrderIntent;

const REQUIRED_COLUMNS: [&str; 5] = [
    "trading_symbol",
    "quantity",
    "order_type",
    "limit_price",
    "is_active",
];

#[derive(Debug, thiserror::Error)]
pub enum StockConfigError {
    #[error("Failed to read stock list: {0}")]
    Csv(#[from] csv::Error),
    #[error("Stock list is missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),
    #[error("Line {line}: invalid quantity '{value}'")]
    InvalidQuantity { line: usize, value: String },
    #[error("Line {line}: {source}")]
    InvalidOrderType {
        line: usize,
        source: InvalidOrderTypeError,
    },
    #[error("Line {line}: invalid limit price '{value}'")]
    InvalidLimitPrice { line: usize, value: String },
    #[error("Line {line}: invalid is_active flag '{value}'")]
    InvalidFlag { line: usize, value: String },
}

pub fn load_stock_list(path: &Path) -> Result<Vec<OrderIntent>, StockConfigError> {
    let reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_path(path)?;
    let intents = read_intents(reader)?;

    let active = intents.iter().filter(|intent| intent.is_active).count();
    info!(
        path = %path.display(),
        total = intents.len(),
        active,
        "Loaded stock list"
    );

    Ok(intents)
}

fn read_intents<R: std::io::Read>(
    mut reader: csv::Reader<R>,
) -> Result<Vec<OrderIntent>, StockConfigError> {
    let headers = reader.headers()?.clone();
    let position = |column: &str| headers.iter().position(|header| header == column);

    let missing: Vec<String> = REQUIRED_COLUMNS
        .into_iter()
        .filter(|column| position(column).is_none())
        .map(ToString::to_string)
        .collect();
    if !missing.is_empty() {
        return Err(StockConfigError::MissingColumns(missing));
    }

    let [symbol, quantity, order_type, limit_price, is_active] =
        REQUIRED_COLUMNS.map(|column| position(column).unwrap_or_default());

    let mut intents = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        // header is line 1
        let line = index + 2;
        let field = |column: usize| record.get(column).unwrap_or_default();

        let raw_flag = field(is_active);
        let active = parse_flag(raw_flag).ok_or_else(|| StockConfigError::InvalidFlag {
            line,
            value: raw_flag.to_string(),
        })?;

        if !active {
            // Inactive rows load leniently.
            intents.push(OrderIntent {
                symbol: field(symbol).to_string(),
                quantity: field(quantity).parse().unwrap_or_default(),
                order_type: OrderType::from_str(field(order_type)).unwrap_or(OrderType::Market),
                limit_price: Decimal::from_str(field(limit_price)).ok(),
                is_active: false,
            });
            continue;
        }

        let raw_quantity = field(quantity);
        let parsed_quantity =
            raw_quantity
                .parse::<i64>()
                .map_err(|_| StockConfigError::InvalidQuantity {
                    line,
                    value: raw_quantity.to_string(),
                })?;

        let parsed_order_type = OrderType::from_str(field(order_type))
            .map_err(|source| StockConfigError::InvalidOrderType { line, source })?;

        let raw_price = field(limit_price);
        let parsed_price = if raw_price.is_empty() {
            None
        } else {
            Some(
                Decimal::from_str(raw_price).map_err(|_| StockConfigError::InvalidLimitPrice {
                    line,
                    value: raw_price.to_string(),
                })?,
            )
        };

        intents.push(OrderIntent {
            symbol: field(symbol).to_string(),
            quantity: parsed_quantity,
            order_type: parsed_order_type,
            limit_price: parsed_price,
            is_active: true,
        });
    }

    Ok(intents)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "y" => Some(true),
        "false" | "0" | "no" | "n" => Some(false),
        _ => None,
    }
}

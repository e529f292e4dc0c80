use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use super::{KiteBroker, kite_headers, parse_response};
use crate::{BrokerError, OrderPlacement, OrderRequest, Session, Symbol};

const VARIETY: &str = "regular";
const VALIDITY: &str = "DAY";

#[derive(Debug, Deserialize)]
struct PlaceOrderData {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct LtpQuote {
    last_price: Decimal,
}

#[derive(Debug, Serialize)]
struct MarginOrderParams<'a> {
    exchange: &'a str,
    tradingsymbol: &'a str,
    transaction_type: &'a str,
    variety: &'a str,
    product: &'a str,
    order_type: &'a str,
    quantity: u32,
    #[serde(with = "rust_decimal::serde::float")]
    price: Decimal,
}

#[derive(Debug, Deserialize)]
struct OrderMargin {
    total: Decimal,
}

#[derive(Debug, Deserialize)]
struct AvailableMargin {
    cash: Decimal,
}

#[derive(Debug, Deserialize)]
struct SegmentMargin {
    available: AvailableMargin,
}

fn order_form(order: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut form = vec![
        ("exchange", order.symbol.exchange().as_str().to_string()),
        ("tradingsymbol", order.symbol.tradingsymbol().to_string()),
        ("transaction_type", order.transaction_type.as_str().to_string()),
        ("order_type", order.order_type.as_str().to_string()),
        ("quantity", order.quantity.to_string()),
        ("product", order.product.as_str().to_string()),
        ("validity", VALIDITY.to_string()),
    ];

    if let Some(price) = order.price {
        form.push(("price", price.normalize().to_string()));
    }

    form
}

pub(crate) async fn place_order(
    broker: &KiteBroker,
    session: &Session,
    order: &OrderRequest,
) -> Result<OrderPlacement, BrokerError> {
    debug!(
        symbol = %order.symbol,
        quantity = order.quantity,
        order_type = %order.order_type,
        price = ?order.price,
        product = %order.product,
        "Placing Kite order"
    );

    let response = broker
        .client()
        .post(broker.url(&format!("/orders/{VARIETY}")))
        .headers(kite_headers(Some(session))?)
        .form(&order_form(order))
        .send()
        .await?;

    let data: PlaceOrderData = parse_response("place order", response).await?;
    info!(symbol = %order.symbol, order_id = %data.order_id, "Kite accepted order");

    Ok(OrderPlacement {
        order_id: data.order_id,
        symbol: order.symbol.clone(),
        placed_at: chrono::Utc::now(),
    })
}

pub(crate) async fn last_price(
    broker: &KiteBroker,
    session: &Session,
    symbol: &Symbol,
) -> Result<Decimal, BrokerError> {
    let instrument = symbol.to_string();
    let response = broker
        .client()
        .get(broker.url("/quote/ltp"))
        .headers(kite_headers(Some(session))?)
        .query(&[("i", instrument.as_str())])
        .send()
        .await?;

    let mut quotes: HashMap<String, LtpQuote> = parse_response("get ltp", response).await?;

    quotes
        .remove(&instrument)
        .map(|quote| quote.last_price)
        .ok_or_else(|| BrokerError::MissingField {
            action: "get ltp".to_string(),
            field: instrument,
        })
}

pub(crate) async fn required_margin(
    broker: &KiteBroker,
    session: &Session,
    order: &OrderRequest,
) -> Result<Decimal, BrokerError> {
    let params = [MarginOrderParams {
        exchange: order.symbol.exchange().as_str(),
        tradingsymbol: order.symbol.tradingsymbol(),
        transaction_type: order.transaction_type.as_str(),
        variety: VARIETY,
        product: order.product.as_str(),
        order_type: order.order_type.as_str(),
        quantity: order.quantity,
        price: order.price.unwrap_or_default(),
    }];

    let response = broker
        .client()
        .post(broker.url("/margins/orders"))
        .headers(kite_headers(Some(session))?)
        .json(&params)
        .send()
        .await?;

    let margins: Vec<OrderMargin> = parse_response("get order margins", response).await?;

    margins
        .first()
        .map(|margin| margin.total)
        .ok_or_else(|| BrokerError::MissingField {
            action: "get order margins".to_string(),
            field: "total".to_string(),
        })
}

pub(crate) async fn available_cash(
    broker: &KiteBroker,
    session: &Session,
) -> Result<Decimal, BrokerError> {
    let response = broker
        .client()
        .get(broker.url("/user/margins/equity"))
        .headers(kite_headers(Some(session))?)
        .send()
        .await?;

    let margin: SegmentMargin = parse_response("get equity margins", response).await?;
    Ok(margin.available.cash)
}

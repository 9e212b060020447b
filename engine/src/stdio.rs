//! Stdin command protocol
//!
//! Newline-delimited text commands:
//!
//! ```text
//! ORDER <BUY|SELL> <symbol> <qty> <price> <client_order_id>
//! CANCEL <client_order_id>
//! QUERY <client_order_id>
//! ```
//!
//! Parse failures produce an `error` event with code `parse` and never
//! kill the process.

use common::{ClientOrderId, EngineError, Px, Qty, Side};

/// One parsed stdin command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Place a limit order
    Order {
        /// Buy or sell
        side: Side,
        /// Wire symbol name
        symbol: String,
        /// Quantity
        qty: Qty,
        /// Limit price
        price: Px,
        /// Caller-assigned id
        client_id: ClientOrderId,
    },
    /// Cancel by client id
    Cancel {
        /// Caller-assigned id
        client_id: ClientOrderId,
    },
    /// Query order state by client id
    Query {
        /// Caller-assigned id
        client_id: ClientOrderId,
    },
}

/// Parse one stdin line
pub fn parse_line(line: &str) -> Result<Command, EngineError> {
    let mut parts = line.split_ascii_whitespace();
    let verb = parts
        .next()
        .ok_or_else(|| EngineError::Parse("empty command".into()))?;

    match verb {
        "ORDER" => {
            let side = match parts.next() {
                Some("BUY") => Side::Buy,
                Some("SELL") => Side::Sell,
                other => {
                    return Err(EngineError::Parse(format!(
                        "expected BUY or SELL, got {other:?}"
                    )));
                }
            };
            let symbol = parts
                .next()
                .ok_or_else(|| EngineError::Parse("missing symbol".into()))?
                .to_string();
            let qty = parts
                .next()
                .ok_or_else(|| EngineError::Parse("missing qty".into()))
                .and_then(|s| {
                    Qty::parse(s).map_err(|e| EngineError::Parse(e.to_string()))
                })?;
            if qty.as_i64() <= 0 {
                return Err(EngineError::Parse("qty must be positive".into()));
            }
            let price = parts
                .next()
                .ok_or_else(|| EngineError::Parse("missing price".into()))
                .and_then(|s| {
                    Px::parse(s).map_err(|e| EngineError::Parse(e.to_string()))
                })?;
            if price.as_i64() <= 0 {
                return Err(EngineError::Parse("price must be positive".into()));
            }
            let client_id = parse_client_id(parts.next())?;
            expect_end(parts)?;
            Ok(Command::Order {
                side,
                symbol,
                qty,
                price,
                client_id,
            })
        }
        "CANCEL" => {
            let client_id = parse_client_id(parts.next())?;
            expect_end(parts)?;
            Ok(Command::Cancel { client_id })
        }
        "QUERY" => {
            let client_id = parse_client_id(parts.next())?;
            expect_end(parts)?;
            Ok(Command::Query { client_id })
        }
        other => Err(EngineError::Parse(format!("unknown command: {other}"))),
    }
}

fn parse_client_id(token: Option<&str>) -> Result<ClientOrderId, EngineError> {
    let raw = token.ok_or_else(|| EngineError::Parse("missing client_order_id".into()))?;
    ClientOrderId::new(raw).map_err(|e| EngineError::Parse(e.to_string()))
}

fn expect_end<'a>(mut parts: impl Iterator<Item = &'a str>) -> Result<(), EngineError> {
    match parts.next() {
        None => Ok(()),
        Some(extra) => Err(EngineError::Parse(format!("unexpected token: {extra}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_order() {
        let cmd = parse_line("ORDER BUY BTCUSDT 0.001 50000 c1").unwrap();
        assert_eq!(
            cmd,
            Command::Order {
                side: Side::Buy,
                symbol: "BTCUSDT".to_string(),
                qty: Qty::parse("0.001").unwrap(),
                price: Px::parse("50000").unwrap(),
                client_id: ClientOrderId::new("c1").unwrap(),
            }
        );

        let cmd = parse_line("ORDER SELL ETHUSDT 1.5 3200.25 my_order-42").unwrap();
        assert!(matches!(cmd, Command::Order { side: Side::Sell, .. }));
    }

    #[test]
    fn parses_cancel_and_query() {
        assert_eq!(
            parse_line("CANCEL c1").unwrap(),
            Command::Cancel {
                client_id: ClientOrderId::new("c1").unwrap()
            }
        );
        assert_eq!(
            parse_line("QUERY c1").unwrap(),
            Command::Query {
                client_id: ClientOrderId::new("c1").unwrap()
            }
        );
    }

    #[rstest]
    #[case::empty("")]
    #[case::unknown_verb("NOPE BUY BTCUSDT 1 1 c1")]
    #[case::bad_side("ORDER HOLD BTCUSDT 1 1 c1")]
    #[case::truncated("ORDER BUY")]
    #[case::bad_qty("ORDER BUY BTCUSDT abc 50000 c1")]
    #[case::bad_price("ORDER BUY BTCUSDT 0.001 xyz c1")]
    #[case::zero_qty("ORDER BUY BTCUSDT 0 50000 c1")]
    #[case::negative_price("ORDER BUY BTCUSDT 0.001 -5 c1")]
    #[case::bad_id_charset("ORDER BUY BTCUSDT 0.001 50000 bad!id")]
    #[case::trailing_token("ORDER BUY BTCUSDT 0.001 50000 c1 extra")]
    #[case::cancel_missing_id("CANCEL")]
    #[case::cancel_two_ids("CANCEL two ids")]
    fn rejects_malformed_input(#[case] bad: &str) {
        let err = parse_line(bad).unwrap_err();
        assert_eq!(err.code(), "parse", "input {bad:?} gave {err}");
    }

    #[test]
    fn id_charset_enforced() {
        assert!(parse_line("CANCEL abc_DEF-123").is_ok());
        assert!(parse_line(&format!("CANCEL {}", "a".repeat(36))).is_ok());
        assert!(parse_line(&format!("CANCEL {}", "a".repeat(37))).is_err());
    }
}

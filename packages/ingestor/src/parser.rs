//! Transfer Attribute Parser
//!
//! Extracts a [`TransferRecord`] from the attributes of a bank `transfer` event.
//! The amount attribute packs magnitude and denom together with no separator
//! (`123456uatom`); it is split into the leading digit run and the remainder.

use thiserror::Error;

use crate::source::Event;

/// Event type emitted by the bank module for every coin movement
pub const EVENT_TYPE_TRANSFER: &str = "transfer";

pub const ATTRIBUTE_KEY_AMOUNT: &str = "amount";
pub const ATTRIBUTE_KEY_SENDER: &str = "sender";
pub const ATTRIBUTE_KEY_RECIPIENT: &str = "recipient";

/// Errors that can occur while parsing a transfer event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Event carries no amount attribute")]
    MissingAmount,

    #[error("Amount '{0}' does not start with a digit")]
    MissingDigits(String),

    #[error("Amount '{0}' has no denom")]
    MissingDenom(String),

    #[error("Amount '{0}' has digits after the denom")]
    TrailingDigits(String),

    #[error("Amount '{0}' magnitude is not a number")]
    InvalidMagnitude(String),
}

/// A single coin movement extracted from a transfer event
#[derive(Debug, Clone, PartialEq)]
pub struct TransferRecord {
    pub sender: String,
    pub recipient: String,
    pub denom: String,
    pub amount: f64,
}

/// A parsed `<digits><denom>` coin string
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coin<'a> {
    pub amount: f64,
    pub denom: &'a str,
}

/// Split a coin string into magnitude and denom
///
/// First pass takes the maximal run of ASCII digits, second pass takes the
/// rest, which must be non-empty and digit-free.
pub fn parse_coin(raw: &str) -> Result<Coin<'_>, ParseError> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, denom) = raw.split_at(split);

    if digits.is_empty() {
        return Err(ParseError::MissingDigits(raw.to_string()));
    }
    if denom.is_empty() {
        return Err(ParseError::MissingDenom(raw.to_string()));
    }
    if denom.chars().any(|c| c.is_ascii_digit()) {
        return Err(ParseError::TrailingDigits(raw.to_string()));
    }

    let amount: f64 = digits
        .parse()
        .map_err(|_| ParseError::InvalidMagnitude(raw.to_string()))?;
    if !amount.is_finite() {
        return Err(ParseError::InvalidMagnitude(raw.to_string()));
    }

    Ok(Coin { amount, denom })
}

/// Whether the event is a bank transfer this parser understands
pub fn is_transfer_event(event: &Event) -> bool {
    event.kind == EVENT_TYPE_TRANSFER
}

/// Build a transfer record from an event's attributes
///
/// Unknown keys are ignored. When a key repeats, the last value wins.
/// Sender and recipient default to empty when absent; the amount is mandatory.
pub fn parse_transfer(event: &Event) -> Result<TransferRecord, ParseError> {
    let mut amount = None;
    let mut sender = String::new();
    let mut recipient = String::new();

    for attr in &event.attributes {
        match attr.key.as_str() {
            ATTRIBUTE_KEY_AMOUNT => amount = Some(attr.value.as_str()),
            ATTRIBUTE_KEY_SENDER => sender = attr.value.clone(),
            ATTRIBUTE_KEY_RECIPIENT => recipient = attr.value.clone(),
            _ => {}
        }
    }

    let coin = parse_coin(amount.ok_or(ParseError::MissingAmount)?)?;
    Ok(TransferRecord {
        sender,
        recipient,
        denom: coin.denom.to_string(),
        amount: coin.amount,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::EventAttribute;

    fn transfer_event(attrs: &[(&str, &str)]) -> Event {
        Event::new(
            EVENT_TYPE_TRANSFER,
            attrs
                .iter()
                .map(|(k, v)| EventAttribute::new(*k, *v))
                .collect(),
        )
    }

    // ==================== parse_coin tests ====================

    #[test]
    fn test_parse_coin_splits_digits_and_denom() {
        let coin = parse_coin("123456uatom").unwrap();
        assert_eq!(coin.amount, 123456.0);
        assert_eq!(coin.denom, "uatom");
    }

    #[test]
    fn test_parse_coin_large_magnitude() {
        let coin = parse_coin("150000000000uatom").unwrap();
        assert_eq!(coin.amount, 1.5e11);
    }

    #[test]
    fn test_parse_coin_zero() {
        let coin = parse_coin("0usei").unwrap();
        assert_eq!(coin.amount, 0.0);
        assert_eq!(coin.denom, "usei");
    }

    #[test]
    fn test_parse_coin_denom_with_symbols() {
        let coin = parse_coin("5factory/sei/coin").unwrap();
        assert_eq!(coin.amount, 5.0);
        assert_eq!(coin.denom, "factory/sei/coin");
    }

    #[test]
    fn test_parse_coin_without_digits() {
        assert_eq!(
            parse_coin("uatom"),
            Err(ParseError::MissingDigits("uatom".to_string()))
        );
    }

    #[test]
    fn test_parse_coin_without_denom() {
        assert_eq!(
            parse_coin("12345"),
            Err(ParseError::MissingDenom("12345".to_string()))
        );
    }

    #[test]
    fn test_parse_coin_empty() {
        assert!(matches!(parse_coin(""), Err(ParseError::MissingDigits(_))));
    }

    #[test]
    fn test_parse_coin_rejects_digits_in_remainder() {
        assert!(matches!(
            parse_coin("10uatom,20uosmo"),
            Err(ParseError::TrailingDigits(_))
        ));
    }

    #[test]
    fn test_parse_coin_rejects_decimal_point_magnitude() {
        // "1.5" leaves ".5uatom" as remainder, which still holds a digit
        assert!(matches!(
            parse_coin("1.5uatom"),
            Err(ParseError::TrailingDigits(_))
        ));
    }

    #[test]
    fn test_parse_coin_negative_sign_is_not_a_digit() {
        assert!(matches!(parse_coin("-5uatom"), Err(ParseError::MissingDigits(_))));
    }

    // ==================== parse_transfer tests ====================

    #[test]
    fn test_parse_transfer_full_record() {
        let event = transfer_event(&[
            ("recipient", "cosmos1to"),
            ("sender", "cosmos1from"),
            ("amount", "150000000000uatom"),
        ]);
        let record = parse_transfer(&event).unwrap();
        assert_eq!(
            record,
            TransferRecord {
                sender: "cosmos1from".to_string(),
                recipient: "cosmos1to".to_string(),
                denom: "uatom".to_string(),
                amount: 1.5e11,
            }
        );
    }

    #[test]
    fn test_parse_transfer_ignores_unknown_keys() {
        let event = transfer_event(&[("msg_index", "0"), ("amount", "7uosmo"), ("memo", "hi")]);
        let record = parse_transfer(&event).unwrap();
        assert_eq!(record.amount, 7.0);
        assert_eq!(record.sender, "");
        assert_eq!(record.recipient, "");
    }

    #[test]
    fn test_parse_transfer_missing_amount() {
        let event = transfer_event(&[("sender", "a"), ("recipient", "b")]);
        assert_eq!(parse_transfer(&event), Err(ParseError::MissingAmount));
    }

    #[test]
    fn test_parse_transfer_malformed_amount() {
        let event = transfer_event(&[("amount", "lots"), ("sender", "a")]);
        assert!(matches!(
            parse_transfer(&event),
            Err(ParseError::MissingDigits(_))
        ));
    }

    #[test]
    fn test_parse_transfer_last_amount_wins() {
        let event = transfer_event(&[("amount", "1uatom"), ("amount", "2uatom")]);
        assert_eq!(parse_transfer(&event).unwrap().amount, 2.0);
    }

    #[test]
    fn test_is_transfer_event() {
        assert!(is_transfer_event(&transfer_event(&[])));
        assert!(!is_transfer_event(&Event::new("coin_spent", vec![])));
    }
}

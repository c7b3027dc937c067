//! Outbound commands (upper computer -> VMC) and their payload encoders.
//!
//! Encoders produce the payload *without* the sequence byte; the engine prefixes it on every
//! send attempt.

use crate::base::{Error, Result};
use byteorder::{BigEndian, WriteBytesExt};
use serde_json::{Map, Value};

/// Fields of an inbound request, e.g. `{"type": "buy", "selection": 12}`.
pub type RequestFields = Map<String, Value>;

/// Turns request fields into a command payload.
pub type EncodeFn = fn(&RequestFields) -> Result<Vec<u8>>;

// Link control, consumed and produced by the engine only

/// Heartbeat sent by the VMC; the only moment the upper computer may transmit.
pub const VMC_CMD_POLL: u8 = 0x41;

/// Bare acknowledgment, zero-length payload, both directions.
pub const VMC_CMD_ACK: u8 = 0x42;

// Application commands

/// Ask whether a selection can be sold.
pub const VMC_CMD_CHECK_SELECTION: u8 = 0x01;

/// Select a product to buy.
pub const VMC_CMD_BUY: u8 = 0x03;

/// Select or cancel a selection.
pub const VMC_CMD_SELECT_OR_CANCEL: u8 = 0x05;

/// Dispense immediately, bypassing payment.
pub const VMC_CMD_DIRECT_VEND: u8 = 0x06;

/// Slot information; sent by the VMC after an information sync.
pub const VMC_CMD_SLOT_INFO: u8 = 0x11;

/// Set the price of a selection.
pub const VMC_CMD_SET_PRICE: u8 = 0x12;

/// Set the inventory level of a selection.
pub const VMC_CMD_SET_INVENTORY: u8 = 0x13;

/// Credit money to the machine.
pub const VMC_CMD_ADD_MONEY: u8 = 0x27;

/// Information synchronization; the VMC answers with one slot info frame per selection.
pub const VMC_CMD_INFO_SYNC: u8 = 0x31;

/// Request machine status.
pub const VMC_CMD_MACHINE_STATUS: u8 = 0x52;

/// Deduct an amount from the current credit.
pub const VMC_CMD_DEDUCT: u8 = 0x64;

/// Payment mode byte sent with `add_money`.
const ADD_MONEY_MODE: u8 = 1;

/// One entry of the outbound command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    /// Name clients use in the `type` field.
    pub name: &'static str,

    /// Wire command id.
    pub id: u8,

    /// Payload encoder; `None` means the command carries only the sequence byte.
    pub encoder: Option<EncodeFn>,
}

/// Every outbound command the link knows by name. Ids are unique.
pub static COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "check_selection",
        id: VMC_CMD_CHECK_SELECTION,
        encoder: Some(encode_selection),
    },
    CommandDescriptor {
        name: "buy",
        id: VMC_CMD_BUY,
        encoder: Some(encode_selection),
    },
    CommandDescriptor {
        name: "select_or_cancel",
        id: VMC_CMD_SELECT_OR_CANCEL,
        encoder: Some(encode_selection),
    },
    CommandDescriptor {
        name: "direct_vend",
        id: VMC_CMD_DIRECT_VEND,
        encoder: Some(encode_direct_vend),
    },
    CommandDescriptor {
        name: "slot_info",
        id: VMC_CMD_SLOT_INFO,
        encoder: None,
    },
    CommandDescriptor {
        name: "set_price",
        id: VMC_CMD_SET_PRICE,
        encoder: Some(encode_set_price),
    },
    CommandDescriptor {
        name: "set_inventory",
        id: VMC_CMD_SET_INVENTORY,
        encoder: Some(encode_set_inventory),
    },
    CommandDescriptor {
        name: "add_money",
        id: VMC_CMD_ADD_MONEY,
        encoder: Some(encode_add_money),
    },
    CommandDescriptor {
        name: "get_slots",
        id: VMC_CMD_INFO_SYNC,
        encoder: None,
    },
    CommandDescriptor {
        name: "machine_status",
        id: VMC_CMD_MACHINE_STATUS,
        encoder: None,
    },
    CommandDescriptor {
        name: "deduct",
        id: VMC_CMD_DEDUCT,
        encoder: Some(encode_deduct),
    },
];

fn field_as_u64(fields: &RequestFields, name: &str) -> Result<u64> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(Error::validation(name, "required")),
        Some(Value::Number(n)) => n
            .as_u64()
            .ok_or_else(|| Error::validation(name, format!("expected unsigned integer, got {}", n))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| Error::validation(name, format!("expected unsigned integer, got '{}'", s))),
        Some(other) => Err(Error::validation(
            name,
            format!("expected unsigned integer, got {}", other),
        )),
    }
}

fn required<T: TryFrom<u64>>(fields: &RequestFields, name: &str) -> Result<T> {
    let value = field_as_u64(fields, name)?;
    T::try_from(value).map_err(|_| {
        Error::validation(
            name,
            format!("{} out of range for {} bytes", value, std::mem::size_of::<T>()),
        )
    })
}

/// Reads an optional 0/1 flag, trying each alias in turn. Missing means `default`.
fn optional_flag(fields: &RequestFields, aliases: &[&str], default: bool) -> Result<bool> {
    for name in aliases {
        match fields.get(*name) {
            None | Some(Value::Null) => continue,
            Some(Value::Bool(b)) => return Ok(*b),
            Some(Value::Number(n)) => {
                return match n.as_u64() {
                    Some(0) => Ok(false),
                    Some(1) => Ok(true),
                    _ => Err(Error::validation(name, format!("expected 0 or 1, got {}", n))),
                }
            }
            Some(other) => {
                return Err(Error::validation(
                    name,
                    format!("expected boolean, got {}", other),
                ))
            }
        }
    }
    Ok(default)
}

/// `selection (2)`; shared by check_selection, buy and select_or_cancel.
pub fn encode_selection(fields: &RequestFields) -> Result<Vec<u8>> {
    let selection: u16 = required(fields, "selection")?;
    let mut payload = Vec::with_capacity(2);
    payload.write_u16::<BigEndian>(selection)?;
    Ok(payload)
}

/// `drop_sensor (1), elevator (1), selection (2), cart (1)`.
///
/// Drop sensor and elevator default to "use", cart defaults to "not in cart".
pub fn encode_direct_vend(fields: &RequestFields) -> Result<Vec<u8>> {
    let selection: u16 = required(fields, "selection")?;
    let use_drop = optional_flag(fields, &["use_drop_sensor", "use_drop"], true)?;
    let use_elevator = optional_flag(fields, &["use_elevator"], true)?;
    let cart = optional_flag(fields, &["shopping_cart", "cart"], false)?;

    let mut payload = Vec::with_capacity(5);
    payload.push(u8::from(use_drop));
    payload.push(u8::from(use_elevator));
    payload.write_u16::<BigEndian>(selection)?;
    payload.push(u8::from(cart));
    Ok(payload)
}

/// `selection (2), price (4)`.
pub fn encode_set_price(fields: &RequestFields) -> Result<Vec<u8>> {
    let selection: u16 = required(fields, "selection")?;
    let price: u32 = required(fields, "price")?;
    let mut payload = Vec::with_capacity(6);
    payload.write_u16::<BigEndian>(selection)?;
    payload.write_u32::<BigEndian>(price)?;
    Ok(payload)
}

/// `selection (2), inventory (1)`.
pub fn encode_set_inventory(fields: &RequestFields) -> Result<Vec<u8>> {
    let selection: u16 = required(fields, "selection")?;
    let inventory: u8 = required(fields, "inventory")?;
    let mut payload = Vec::with_capacity(3);
    payload.write_u16::<BigEndian>(selection)?;
    payload.push(inventory);
    Ok(payload)
}

/// `mode (1), amount (4)`.
pub fn encode_add_money(fields: &RequestFields) -> Result<Vec<u8>> {
    let amount: u32 = required(fields, "amount")?;
    let mut payload = Vec::with_capacity(5);
    payload.push(ADD_MONEY_MODE);
    payload.write_u32::<BigEndian>(amount)?;
    Ok(payload)
}

/// `amount (4)`.
pub fn encode_deduct(fields: &RequestFields) -> Result<Vec<u8>> {
    let amount: u32 = required(fields, "amount")?;
    let mut payload = Vec::with_capacity(4);
    payload.write_u32::<BigEndian>(amount)?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;

    fn fields(value: Value) -> RequestFields {
        match value {
            Value::Object(map) => map,
            _ => panic!("test fields must be an object"),
        }
    }

    fn assert_invalid(result: Result<Vec<u8>>, expected_field: &str) {
        match result {
            Err(Error::Validation { field, .. }) => assert_eq!(field, expected_field),
            other => panic!("expected validation error on {}, got {:?}", expected_field, other),
        }
    }

    #[test]
    fn buy_selection_is_two_bytes_big_endian() {
        let payload = encode_selection(&fields(json!({"selection": 12}))).unwrap();
        assert_eq!(payload, [0x00, 0x0C]);
    }

    #[test]
    fn numeric_strings_are_accepted() {
        let payload = encode_selection(&fields(json!({"selection": "258"}))).unwrap();
        assert_eq!(payload, [0x01, 0x02]);
    }

    #[test]
    fn missing_selection_names_the_field() {
        assert_invalid(encode_selection(&fields(json!({}))), "selection");
        assert_invalid(
            encode_selection(&fields(json!({"selection": null}))),
            "selection",
        );
    }

    #[test]
    fn out_of_range_and_negative_values_are_rejected() {
        assert_invalid(
            encode_selection(&fields(json!({"selection": 70000}))),
            "selection",
        );
        assert_invalid(
            encode_selection(&fields(json!({"selection": -1}))),
            "selection",
        );
        assert_invalid(
            encode_set_inventory(&fields(json!({"selection": 1, "inventory": 256}))),
            "inventory",
        );
    }

    #[test]
    fn direct_vend_defaults() {
        let payload = encode_direct_vend(&fields(json!({"selection": 12}))).unwrap();
        assert_eq!(payload, [1, 1, 0x00, 0x0C, 0]);
    }

    #[test]
    fn direct_vend_explicit_flags_and_aliases() {
        let payload = encode_direct_vend(&fields(json!({
            "selection": 3,
            "use_drop_sensor": false,
            "use_elevator": 0,
            "cart": true,
        })))
        .unwrap();
        assert_eq!(payload, [0, 0, 0x00, 0x03, 1]);

        let payload =
            encode_direct_vend(&fields(json!({"selection": 3, "use_drop": false}))).unwrap();
        assert_eq!(payload[0], 0);
    }

    #[test]
    fn direct_vend_rejects_bad_flag() {
        assert_invalid(
            encode_direct_vend(&fields(json!({"selection": 3, "use_elevator": 2}))),
            "use_elevator",
        );
        assert_invalid(
            encode_direct_vend(&fields(json!({"selection": 3, "cart": "yes"}))),
            "cart",
        );
    }

    #[test]
    fn set_price_layout() {
        let payload =
            encode_set_price(&fields(json!({"selection": 12, "price": 150}))).unwrap();
        assert_eq!(payload, [0x00, 0x0C, 0x00, 0x00, 0x00, 0x96]);
        assert_invalid(encode_set_price(&fields(json!({"selection": 12}))), "price");
    }

    #[test]
    fn money_commands() {
        assert_eq!(
            encode_add_money(&fields(json!({"amount": 500}))).unwrap(),
            [0x01, 0x00, 0x00, 0x01, 0xF4]
        );
        assert_eq!(
            encode_deduct(&fields(json!({"amount": 500}))).unwrap(),
            [0x00, 0x00, 0x01, 0xF4]
        );
        assert_invalid(encode_deduct(&fields(json!({"amount": 1.5}))), "amount");
    }

    #[test]
    fn command_table_ids_and_names_are_unique() {
        let ids: HashSet<u8> = COMMANDS.iter().map(|c| c.id).collect();
        let names: HashSet<&str> = COMMANDS.iter().map(|c| c.name).collect();
        assert_eq!(ids.len(), COMMANDS.len());
        assert_eq!(names.len(), COMMANDS.len());
        assert!(!ids.contains(&VMC_CMD_POLL));
        assert!(!ids.contains(&VMC_CMD_ACK));
    }
}

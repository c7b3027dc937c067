//! Inbound data (VMC -> upper computer) and the decoders that turn payloads into events.
//!
//! Every payload opens with the sequence echo (`pack_no`), skipped before the fields below.
//! Multi-byte numbers are big-endian.

use crate::utils::to_hex_compact;
use byteorder::{BigEndian, ByteOrder};
use serde::Serialize;

/// Turns a data frame payload into an event. Never fails: short payloads become
/// [`DecodedEvent::TooShort`].
pub type DecodeFn = fn(&[u8]) -> DecodedEvent;

/// Selection status report.
pub const VMC_ANS_SELECTION_STATUS: u8 = 0x02;

/// Dispensing status report.
pub const VMC_ANS_VEND_STATUS: u8 = 0x04;

/// Selection chosen or cancelled on the machine keypad.
pub const VMC_ANS_SELECT_OR_CANCEL: u8 = 0x05;

/// Price, inventory, capacity and product of one selection.
pub const VMC_ANS_SLOT_INFO: u8 = 0x11;

/// Money inserted into the machine.
pub const VMC_ANS_RECEIVED_MONEY: u8 = 0x21;

/// Current credit held by the machine.
pub const VMC_ANS_CURRENT_AMOUNT: u8 = 0x23;

/// Machine status report.
pub const VMC_ANS_MACHINE_STATUS: u8 = 0x52;

const SLOT_INFO_SIZE: usize = 12;
const VEND_STATUS_SIZE: usize = 4;
const SELECTION_STATUS_SIZE: usize = 4;
const SELECT_OR_CANCEL_SIZE: usize = 3;
const RECEIVED_MONEY_SIZE: usize = 6;
const CURRENT_AMOUNT_SIZE: usize = 5;
const MACHINE_STATUS_SIZE: usize = 25;

const MACHINE_STATUS_TEMPERATURE: usize = 5;
const MACHINE_STATUS_DOOR: usize = 6;
const MACHINE_STATUS_ID: std::ops::Range<usize> = 15..25;

/// A data frame payload, decoded. Produced once per inbound data frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DecodedEvent {
    SlotInfo {
        pack_no: u8,
        selection: u16,
        price: u32,
        inventory: u8,
        capacity: u8,
        product_id: u16,
        status: u8,
    },
    VendStatus {
        pack_no: u8,
        status_code: u8,
        selection: u16,
    },
    SelectionStatus {
        pack_no: u8,
        status_code: u8,
        status_message: &'static str,
        selection: u16,
    },
    SelectOrCancel {
        pack_no: u8,
        selection: u16,
    },
    ReceivedMoney {
        pack_no: u8,
        mode: u8,
        amount: u32,
    },
    CurrentAmount {
        pack_no: u8,
        amount: u32,
    },
    MachineStatus {
        pack_no: u8,
        temperature: u8,
        door_open: bool,
        machine_id: String,
    },
    /// Any command without a specific decoder.
    #[serde(rename = "vmc_data")]
    Generic {
        #[serde(skip_serializing_if = "Option::is_none")]
        pack_no: Option<u8>,
        raw_data: String,
    },
    /// The payload was shorter than its layout requires.
    #[serde(rename = "decode_error")]
    TooShort {
        name: &'static str,
        expected: usize,
        actual: usize,
    },
}

impl DecodedEvent {
    /// Event name as it appears in the `event` field on the messaging interface.
    pub fn name(&self) -> &'static str {
        match self {
            DecodedEvent::SlotInfo { .. } => "slot_info",
            DecodedEvent::VendStatus { .. } => "vend_status",
            DecodedEvent::SelectionStatus { .. } => "selection_status",
            DecodedEvent::SelectOrCancel { .. } => "select_or_cancel",
            DecodedEvent::ReceivedMoney { .. } => "received_money",
            DecodedEvent::CurrentAmount { .. } => "current_amount",
            DecodedEvent::MachineStatus { .. } => "machine_status",
            DecodedEvent::Generic { .. } => "vmc_data",
            DecodedEvent::TooShort { .. } => "decode_error",
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, DecodedEvent::TooShort { .. })
    }
}

/// Inbound command ids with a specific decoder.
pub static DECODERS: &[(u8, DecodeFn)] = &[
    (VMC_ANS_SELECTION_STATUS, decode_selection_status),
    (VMC_ANS_VEND_STATUS, decode_vend_status),
    (VMC_ANS_SELECT_OR_CANCEL, decode_select_or_cancel),
    (VMC_ANS_SLOT_INFO, decode_slot_info),
    (VMC_ANS_RECEIVED_MONEY, decode_received_money),
    (VMC_ANS_CURRENT_AMOUNT, decode_current_amount),
    (VMC_ANS_MACHINE_STATUS, decode_machine_status),
];

macro_rules! require_len {
    ($payload:expr, $size:expr, $name:expr) => {
        if $payload.len() < $size {
            return DecodedEvent::TooShort {
                name: $name,
                expected: $size,
                actual: $payload.len(),
            };
        }
    };
}

/// Human readable text for a selection status code.
pub fn selection_status_message(code: u8) -> &'static str {
    match code {
        0x01 => "Normal",
        0x02 => "Out of stock",
        0x03 => "Selection doesn't exist",
        0x04 => "Selection pause",
        0x05 => "There is product inside elevator",
        0x06 => "Delivery door unlocked",
        0x07 => "Elevator error",
        0x08 => "Elevator self-checking faulty",
        _ => "Unknown status",
    }
}

/// `selection (2), price (4), inventory (1), capacity (1), product_id (2), status (1)`
pub fn decode_slot_info(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, SLOT_INFO_SIZE, "slot_info");
    let p = &payload[1..];
    DecodedEvent::SlotInfo {
        pack_no: payload[0],
        selection: BigEndian::read_u16(&p[0..2]),
        price: BigEndian::read_u32(&p[2..6]),
        inventory: p[6],
        capacity: p[7],
        product_id: BigEndian::read_u16(&p[8..10]),
        status: p[10],
    }
}

/// `status (1), selection (2)`; a trailing microwave byte on some machines is ignored.
pub fn decode_vend_status(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, VEND_STATUS_SIZE, "vend_status");
    DecodedEvent::VendStatus {
        pack_no: payload[0],
        status_code: payload[1],
        selection: BigEndian::read_u16(&payload[2..4]),
    }
}

/// `status (1), selection (2)`
pub fn decode_selection_status(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, SELECTION_STATUS_SIZE, "selection_status");
    let status_code = payload[1];
    DecodedEvent::SelectionStatus {
        pack_no: payload[0],
        status_code,
        status_message: selection_status_message(status_code),
        selection: BigEndian::read_u16(&payload[2..4]),
    }
}

/// `selection (2)`
pub fn decode_select_or_cancel(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, SELECT_OR_CANCEL_SIZE, "select_or_cancel");
    DecodedEvent::SelectOrCancel {
        pack_no: payload[0],
        selection: BigEndian::read_u16(&payload[1..3]),
    }
}

/// `mode (1), amount (4)`
pub fn decode_received_money(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, RECEIVED_MONEY_SIZE, "received_money");
    DecodedEvent::ReceivedMoney {
        pack_no: payload[0],
        mode: payload[1],
        amount: BigEndian::read_u32(&payload[2..6]),
    }
}

/// `amount (4)`
pub fn decode_current_amount(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, CURRENT_AMOUNT_SIZE, "current_amount");
    DecodedEvent::CurrentAmount {
        pack_no: payload[0],
        amount: BigEndian::read_u32(&payload[1..5]),
    }
}

pub fn decode_machine_status(payload: &[u8]) -> DecodedEvent {
    require_len!(payload, MACHINE_STATUS_SIZE, "machine_status");
    let machine_id = payload[MACHINE_STATUS_ID]
        .iter()
        .filter(|b| b.is_ascii() && **b != 0)
        .map(|b| *b as char)
        .collect();
    DecodedEvent::MachineStatus {
        pack_no: payload[0],
        temperature: payload[MACHINE_STATUS_TEMPERATURE],
        door_open: payload[MACHINE_STATUS_DOOR] == 1,
        machine_id,
    }
}

/// Fallback for any command id without a specific decoder. Always succeeds.
pub fn decode_generic(payload: &[u8]) -> DecodedEvent {
    match payload.split_first() {
        Some((pack_no, rest)) => DecodedEvent::Generic {
            pack_no: Some(*pack_no),
            raw_data: to_hex_compact(rest),
        },
        None => DecodedEvent::Generic {
            pack_no: None,
            raw_data: String::new(),
        },
    }
}

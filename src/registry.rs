use crate::answers::{decode_generic, DecodeFn, DecodedEvent, DECODERS};
use crate::base::{Error, Result};
use crate::cmds::{CommandDescriptor, RequestFields, COMMANDS};
use log::{debug, trace};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;

/// An outbound request resolved against the command table, ready to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCommand {
    /// Command name from the request.
    pub name: &'static str,

    /// Wire command id.
    pub id: u8,

    /// Payload without the sequence byte.
    pub payload: Vec<u8>,

    /// Human readable summary, e.g. `buy selection=12`.
    pub description: String,
}

/// Immutable name/id lookup for encoders and decoders, built once per process.
#[derive(Debug)]
pub struct CommandRegistry {
    by_name: HashMap<&'static str, &'static CommandDescriptor>,
    by_id: HashMap<u8, &'static CommandDescriptor>,
    decoders: HashMap<u8, DecodeFn>,
}

impl CommandRegistry {
    fn new() -> CommandRegistry {
        let by_name = COMMANDS.iter().map(|c| (c.name, c)).collect();
        let by_id = COMMANDS.iter().map(|c| (c.id, c)).collect();
        let decoders = DECODERS.iter().copied().collect();
        debug!(
            "Command registry built: {} commands, {} decoders",
            COMMANDS.len(),
            DECODERS.len()
        );
        CommandRegistry {
            by_name,
            by_id,
            decoders,
        }
    }

    /// The process-wide registry.
    pub fn global() -> &'static CommandRegistry {
        static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();
        REGISTRY.get_or_init(CommandRegistry::new)
    }

    /// Command id for an outbound command name.
    pub fn id_of(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).map(|c| c.id)
    }

    /// Command name for an id, if the id is in the outbound table.
    pub fn name_of(&self, id: u8) -> Option<&'static str> {
        self.by_id.get(&id).map(|c| c.name)
    }

    /// Whether `id` has a specific decoder (as opposed to the generic fallback).
    pub fn has_decoder(&self, id: u8) -> bool {
        self.decoders.contains_key(&id)
    }

    /// Validates and encodes an outbound request. Unknown names are rejected before any
    /// payload is built.
    pub fn encode(&self, name: &str, fields: &RequestFields) -> Result<EncodedCommand> {
        let descriptor = self
            .by_name
            .get(name)
            .ok_or_else(|| Error::UnknownCommand(name.to_owned()))?;

        let payload = match descriptor.encoder {
            Some(encode) => encode(fields)?,
            None => Vec::new(),
        };
        trace!(
            "Encoded {} (0x{:02X}) payload {:02X?}",
            descriptor.name,
            descriptor.id,
            payload
        );

        Ok(EncodedCommand {
            name: descriptor.name,
            id: descriptor.id,
            payload,
            description: describe(descriptor.name, fields),
        })
    }

    /// Decodes an inbound payload, falling back to the generic decoder for unknown ids.
    pub fn decode(&self, id: u8, payload: &[u8]) -> DecodedEvent {
        match self.decoders.get(&id) {
            Some(decode) => decode(payload),
            None => {
                trace!("No decoder for 0x{:02X}, using generic", id);
                decode_generic(payload)
            }
        }
    }
}

fn describe(name: &str, fields: &RequestFields) -> String {
    let mut description = name.to_owned();
    for (key, value) in fields {
        if key == "type" {
            continue;
        }
        let rendered = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        description.push(' ');
        description.push_str(key);
        description.push('=');
        description.push_str(&rendered);
    }
    description
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmds::{VMC_CMD_BUY, VMC_CMD_INFO_SYNC};
    use serde_json::json;

    fn fields(value: Value) -> RequestFields {
        match value {
            Value::Object(map) => map,
            _ => panic!("test fields must be an object"),
        }
    }

    #[test]
    fn name_and_id_lookups() {
        let registry = CommandRegistry::global();
        assert_eq!(registry.id_of("buy"), Some(VMC_CMD_BUY));
        assert_eq!(registry.name_of(0x12), Some("set_price"));
        assert_eq!(registry.id_of("refund"), None);
        assert!(registry.has_decoder(0x11));
        assert!(!registry.has_decoder(0x99));
    }

    #[test]
    fn encode_buy() {
        let cmd = CommandRegistry::global()
            .encode("buy", &fields(json!({"type": "buy", "selection": 12})))
            .unwrap();
        assert_eq!(cmd.id, 0x03);
        assert_eq!(cmd.payload, [0x00, 0x0C]);
        assert_eq!(cmd.description, "buy selection=12");
    }

    #[test]
    fn command_without_encoder_has_empty_payload() {
        let cmd = CommandRegistry::global()
            .encode("get_slots", &RequestFields::new())
            .unwrap();
        assert_eq!(cmd.id, VMC_CMD_INFO_SYNC);
        assert!(cmd.payload.is_empty());
        assert_eq!(cmd.description, "get_slots");
    }

    #[test]
    fn unknown_command_is_rejected() {
        match CommandRegistry::global().encode("refund", &RequestFields::new()) {
            Err(Error::UnknownCommand(name)) => assert_eq!(name, "refund"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn validation_errors_pass_through() {
        let result = CommandRegistry::global().encode("set_price", &fields(json!({"selection": 1})));
        assert!(matches!(result, Err(Error::Validation { ref field, .. }) if field == "price"));
    }

    #[test]
    fn decode_falls_back_to_generic() {
        let event = CommandRegistry::global().decode(0x99, &[0x07, 0xAA, 0xBB]);
        assert_eq!(
            event,
            DecodedEvent::Generic {
                pack_no: Some(7),
                raw_data: "AABB".to_owned(),
            }
        );
    }

    #[test]
    fn decode_uses_specific_decoder() {
        let event = CommandRegistry::global().decode(0x23, &[0x01, 0x00, 0x00, 0x00, 0x64]);
        assert_eq!(event.name(), "current_amount");
    }
}

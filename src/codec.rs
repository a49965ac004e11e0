//! Command codec: instruction <-> envelope conversions.
//!
//! Two independent directions, each driven by a name-indexed table the way
//! the wire vocabulary is registered once at construction. Inbound bytes are
//! tried as a command first; a decode failure there falls through to the
//! response path at the call site.

use std::collections::HashMap;

use tracing::debug;

use crate::error::{NetError, Result};
use crate::messages::{
    decode, encode, CommandEnvelope, CommandId, DeviceId, OpenDataConnectionBody,
    ResponseEnvelope, ResponseStatus,
};

/// Wire name of the single registered lifecycle command.
pub const OPEN_DATA_CONNECTION: &str = "lifecycle.open_data_connection";

/// Locally executable instruction parsed from (or serialized into) a
/// command envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    OpenDataConnection {
        /// Peer the instruction is associated with.
        device_id: DeviceId,
        body: OpenDataConnectionBody,
    },
}

impl Instruction {
    pub fn command_name(&self) -> &'static str {
        match self {
            Instruction::OpenDataConnection { .. } => OPEN_DATA_CONNECTION,
        }
    }
}

/// Result of executing an instruction, fed back through the response path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionResult {
    OpenDataConnection { accepted: bool },
}

/// Serializes and returns the response bytes for an executed instruction.
pub type ResponseThunk = Box<dyn FnOnce(&InstructionResult) -> Result<Vec<u8>> + Send>;

/// A parsed inbound command plus, when the sender expects one, the thunk
/// that produces its response bytes.
pub struct ParsedCommand {
    pub instruction: Instruction,
    pub command_id: CommandId,
    pub respond: Option<ResponseThunk>,
}

/// Serialized command ready for the wire.
pub struct SerializedCommand {
    pub bytes: Vec<u8>,
    pub command_id: CommandId,
    pub send_response: bool,
}

type CommandSerializer = fn(&Instruction, CommandId) -> Result<SerializedCommand>;
type CommandParser = fn(&CommandEnvelope, DeviceId) -> Result<ParsedCommand>;
type ResponseSerializer = fn(&InstructionResult, CommandId) -> Result<Vec<u8>>;
type ResponseParser = fn(&ResponseEnvelope) -> Result<InstructionResult>;

/// Name-indexed tables for both directions.
pub struct CommandCodec {
    command_serializers: HashMap<&'static str, CommandSerializer>,
    command_parsers: HashMap<&'static str, CommandParser>,
    response_serializers: HashMap<&'static str, ResponseSerializer>,
    response_parsers: HashMap<&'static str, ResponseParser>,
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCodec {
    /// Registers every supported command kind.
    pub fn new() -> Self {
        let mut command_serializers: HashMap<&'static str, CommandSerializer> = HashMap::new();
        let mut command_parsers: HashMap<&'static str, CommandParser> = HashMap::new();
        let mut response_serializers: HashMap<&'static str, ResponseSerializer> = HashMap::new();
        let mut response_parsers: HashMap<&'static str, ResponseParser> = HashMap::new();

        command_serializers.insert(OPEN_DATA_CONNECTION, serialize_open_data_connection);
        command_parsers.insert(OPEN_DATA_CONNECTION, parse_open_data_connection);
        response_serializers.insert(OPEN_DATA_CONNECTION, serialize_open_data_response);
        response_parsers.insert(OPEN_DATA_CONNECTION, parse_open_data_response);

        Self {
            command_serializers,
            command_parsers,
            response_serializers,
            response_parsers,
        }
    }

    /// Wraps an instruction into an outbound command envelope.
    pub fn serialize_command(
        &self,
        instruction: &Instruction,
        command_id: CommandId,
    ) -> Result<SerializedCommand> {
        let serializer = self
            .command_serializers
            .get(instruction.command_name())
            .ok_or_else(|| {
                NetError::Config(format!(
                    "no serializer registered for [{}]",
                    instruction.command_name()
                ))
            })?;
        serializer(instruction, command_id)
    }

    /// Parses inbound bytes as a command envelope.
    ///
    /// Callers fall through to [`Self::parse_response`] when this reports a
    /// decode failure; an explicit envelope discriminator would make the two
    /// cases distinguishable, but the wire format has none.
    pub fn parse_command(&self, raw: &[u8], device_id: DeviceId) -> Result<ParsedCommand> {
        let envelope: CommandEnvelope = decode(raw)?;
        let parser = self.command_parsers.get(envelope.command.as_str()).ok_or_else(|| {
            debug!(
                target: "syncnet::codec",
                command = %envelope.command,
                "not a registered command; trying the response path"
            );
            NetError::Decode(format!("unknown command [{}]", envelope.command))
        })?;
        parser(&envelope, device_id)
    }

    /// Wraps an instruction result into an outbound response envelope.
    pub fn serialize_response(
        &self,
        command_name: &str,
        result: &InstructionResult,
        command_id: CommandId,
    ) -> Result<Vec<u8>> {
        let serializer = self.response_serializers.get(command_name).ok_or_else(|| {
            NetError::Config(format!(
                "no response serializer registered for [{command_name}]"
            ))
        })?;
        serializer(result, command_id)
    }

    /// Parses inbound bytes as a response envelope and yields the command id
    /// whose pending instruction it completes.
    pub fn parse_response(&self, raw: &[u8]) -> Result<(CommandId, InstructionResult)> {
        let envelope: ResponseEnvelope = decode(raw)?;
        let parser = self
            .response_parsers
            .get(envelope.command.as_str())
            .ok_or_else(|| {
                NetError::Decode(format!("unknown response [{}]", envelope.command))
            })?;
        let result = parser(&envelope)?;
        Ok((envelope.command_id, result))
    }
}

fn serialize_open_data_connection(
    instruction: &Instruction,
    command_id: CommandId,
) -> Result<SerializedCommand> {
    let Instruction::OpenDataConnection { body, .. } = instruction;
    let envelope = CommandEnvelope {
        command: OPEN_DATA_CONNECTION.to_string(),
        command_id,
        data: encode(body)?,
        send_response: true,
    };
    Ok(SerializedCommand {
        bytes: encode(&envelope)?,
        command_id,
        send_response: true,
    })
}

fn parse_open_data_connection(
    envelope: &CommandEnvelope,
    device_id: DeviceId,
) -> Result<ParsedCommand> {
    let body: OpenDataConnectionBody = decode(&envelope.data)?;
    let command_id = envelope.command_id;
    let respond: Option<ResponseThunk> = envelope.send_response.then(|| {
        Box::new(move |result: &InstructionResult| {
            serialize_open_data_response(result, command_id)
        }) as ResponseThunk
    });
    Ok(ParsedCommand {
        instruction: Instruction::OpenDataConnection { device_id, body },
        command_id,
        respond,
    })
}

fn serialize_open_data_response(
    result: &InstructionResult,
    command_id: CommandId,
) -> Result<Vec<u8>> {
    let InstructionResult::OpenDataConnection { accepted } = result;
    let envelope = ResponseEnvelope {
        command: OPEN_DATA_CONNECTION.to_string(),
        command_id,
        status: if *accepted {
            ResponseStatus::Ok
        } else {
            ResponseStatus::Failed
        },
        data: None,
    };
    encode(&envelope)
}

fn parse_open_data_response(envelope: &ResponseEnvelope) -> Result<InstructionResult> {
    Ok(InstructionResult::OpenDataConnection {
        accepted: envelope.status == ResponseStatus::Ok,
    })
}

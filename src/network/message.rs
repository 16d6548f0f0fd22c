use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Version advertised in the handshake
pub const PROTOCOL_VERSION: u32 = 1;

/// Width of the zero-padded command name that prefixes every message
pub const COMMAND_LENGTH: usize = 12;

/// Largest inbound message accepted from a peer
pub const MAX_MESSAGE_SIZE: usize = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Message of {0} bytes is shorter than the command header")]
    TooShort(usize),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid payload for {command}: {reason}")]
    InvalidPayload { command: &'static str, reason: String },
}

/// What an `inv` or `getdata` refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvKind {
    Block,
    Tx,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version: u32,
    pub best_height: u64,
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlocks {
    pub addr_from: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inv {
    pub addr_from: String,
    pub kind: InvKind,
    pub items: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetData {
    pub addr_from: String,
    pub kind: InvKind,
    pub id: Vec<u8>,
}

/// A serialized block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub addr_from: String,
    pub block: Vec<u8>,
}

/// A serialized transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    pub addr_from: String,
    pub transaction: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Addr {
    pub addr_list: Vec<String>,
}

/// A gossip message: command header plus its payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    GetBlocks(GetBlocks),
    Inv(Inv),
    GetData(GetData),
    Block(BlockData),
    Tx(TxData),
    Addr(Addr),
}

fn command_to_bytes(command: &str) -> [u8; COMMAND_LENGTH] {
    let mut bytes = [0u8; COMMAND_LENGTH];
    for (slot, byte) in bytes.iter_mut().zip(command.bytes()) {
        *slot = byte;
    }
    bytes
}

fn bytes_to_command(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

fn decode_payload<T: DeserializeOwned>(command: &'static str, payload: &[u8]) -> Result<T, MessageError> {
    bincode::deserialize(payload).map_err(|e| MessageError::InvalidPayload {
        command,
        reason: e.to_string(),
    })
}

impl Message {
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::GetBlocks(_) => "getblocks",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::Addr(_) => "addr",
        }
    }

    /// Header followed by the bincode payload
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            Message::Version(p) => bincode::serialize(p),
            Message::GetBlocks(p) => bincode::serialize(p),
            Message::Inv(p) => bincode::serialize(p),
            Message::GetData(p) => bincode::serialize(p),
            Message::Block(p) => bincode::serialize(p),
            Message::Tx(p) => bincode::serialize(p),
            Message::Addr(p) => bincode::serialize(p),
        }
        .map_err(|e| MessageError::InvalidPayload {
            command: self.command(),
            reason: e.to_string(),
        })?;

        let mut data = Vec::with_capacity(COMMAND_LENGTH + payload.len());
        data.extend_from_slice(&command_to_bytes(self.command()));
        data.extend_from_slice(&payload);
        Ok(data)
    }

    pub fn decode(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() < COMMAND_LENGTH {
            return Err(MessageError::TooShort(data.len()));
        }

        let (header, payload) = data.split_at(COMMAND_LENGTH);
        let message = match bytes_to_command(header).as_str() {
            "version" => Message::Version(decode_payload("version", payload)?),
            "getblocks" => Message::GetBlocks(decode_payload("getblocks", payload)?),
            "inv" => Message::Inv(decode_payload("inv", payload)?),
            "getdata" => Message::GetData(decode_payload("getdata", payload)?),
            "block" => Message::Block(decode_payload("block", payload)?),
            "tx" => Message::Tx(decode_payload("tx", payload)?),
            "addr" => Message::Addr(decode_payload("addr", payload)?),
            other => return Err(MessageError::UnknownCommand(other.to_string())),
        };

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_header() {
        let message = Message::GetBlocks(GetBlocks {
            addr_from: "localhost:3001".to_string(),
        });
        let data = message.encode().unwrap();

        assert_eq!(&data[..9], b"getblocks");
        assert!(data[9..COMMAND_LENGTH].iter().all(|b| *b == 0));
        assert_eq!(Message::decode(&data).unwrap(), message);
    }

    #[test]
    fn test_inv_round_trip() {
        let message = Message::Inv(Inv {
            addr_from: "localhost:3000".to_string(),
            kind: InvKind::Block,
            items: vec![vec![1; 32], vec![2; 32]],
        });

        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn test_unknown_command() {
        let mut data = command_to_bytes("ping").to_vec();
        data.extend_from_slice(&[0, 0]);

        assert!(matches!(
            Message::decode(&data),
            Err(MessageError::UnknownCommand(command)) if command == "ping"
        ));
    }

    #[test]
    fn test_short_and_truncated_messages() {
        assert!(matches!(Message::decode(b"tx"), Err(MessageError::TooShort(2))));

        let message = Message::Version(Version {
            version: PROTOCOL_VERSION,
            best_height: 7,
            addr_from: "localhost:3002".to_string(),
        });
        let data = message.encode().unwrap();

        assert!(matches!(
            Message::decode(&data[..data.len() - 3]),
            Err(MessageError::InvalidPayload { command: "version", .. })
        ));
    }
}

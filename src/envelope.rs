//! Photon envelope (outer datagram) decoder.
//!
//! Every UDP datagram starts with a 12-byte envelope header followed by a
//! declared number of commands, each with its own 12-byte header. The layout
//! is a compatibility contract: all integers big-endian, command length
//! includes the command header itself.
use crate::value::ByteReader;

pub const COMMAND_SEND_RELIABLE: u8 = 6;
pub const COMMAND_SEND_FRAGMENT: u8 = 8;

const ENVELOPE_HEADER_LEN: usize = 12;
const COMMAND_HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandType {
    Reliable,
    Fragment,
    Other(u8),
}

impl From<u8> for CommandType {
    fn from(raw: u8) -> Self {
        match raw {
            COMMAND_SEND_RELIABLE => CommandType::Reliable,
            COMMAND_SEND_FRAGMENT => CommandType::Fragment,
            other => CommandType::Other(other),
        }
    }
}

/// One protocol-level unit inside an envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub kind: CommandType,
    pub channel: u8,
    pub flags: u8,
    pub sequence_number: u32,
    pub payload: Vec<u8>,
}

/// Parse the commands of one datagram.
///
/// A short envelope yields no commands; a command whose declared length would
/// overrun the buffer stops the scan. The commands parsed before the bad one
/// are always returned, so one corrupt trailing command never costs the whole
/// datagram.
pub fn decode_envelope(raw: &[u8]) -> Vec<Command> {
    let mut commands = Vec::new();
    if raw.len() < ENVELOPE_HEADER_LEN {
        return commands;
    }

    let mut r = ByteReader::new(raw);
    // PeerId(2), Crc(1), CmdCount(1), Timestamp(4), Challenge(4)
    let Ok(_peer_id) = r.read_u16("peer id") else { return commands };
    let Ok(_crc) = r.read_u8("crc") else { return commands };
    let Ok(cmd_count) = r.read_u8("command count") else { return commands };
    let Ok(_timestamp) = r.read_u32("timestamp") else { return commands };
    let Ok(_challenge) = r.read_i32("challenge") else { return commands };

    for _ in 0..cmd_count {
        if r.remaining() < COMMAND_HEADER_LEN {
            break;
        }
        // Type(1), Channel(1), Flags(1), Reserved(1), Length(4), Seq(4)
        let Ok(cmd_type) = r.read_u8("command type") else { break };
        let Ok(channel) = r.read_u8("channel") else { break };
        let Ok(flags) = r.read_u8("flags") else { break };
        let Ok(_reserved) = r.read_u8("reserved") else { break };
        let Ok(declared_len) = r.read_u32("command length") else { break };
        let Ok(sequence_number) = r.read_u32("sequence number") else { break };

        // Declared length covers the 12-byte command header.
        let Some(payload_len) = (declared_len as usize).checked_sub(COMMAND_HEADER_LEN) else {
            break;
        };
        let Ok(payload) = r.read_bytes(payload_len, "command payload") else {
            break;
        };

        commands.push(Command {
            kind: CommandType::from(cmd_type),
            channel,
            flags,
            sequence_number,
            payload: payload.to_vec(),
        });
    }
    commands
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(commands: &[(u8, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u16.to_be_bytes()); // peer id
        buf.push(0); // crc
        buf.push(commands.len() as u8);
        buf.extend_from_slice(&0u32.to_be_bytes()); // timestamp
        buf.extend_from_slice(&0i32.to_be_bytes()); // challenge
        for (i, (ty, payload)) in commands.iter().enumerate() {
            buf.push(*ty);
            buf.push(1); // channel
            buf.push(0); // flags
            buf.push(0); // reserved
            buf.extend_from_slice(&((payload.len() + 12) as u32).to_be_bytes());
            buf.extend_from_slice(&(i as u32).to_be_bytes()); // seq
            buf.extend_from_slice(payload);
        }
        buf
    }

    #[test]
    fn decodes_two_commands() {
        let raw = envelope(&[(COMMAND_SEND_RELIABLE, b"abc"), (COMMAND_SEND_FRAGMENT, b"defg")]);
        let cmds = decode_envelope(&raw);
        assert_eq!(cmds.len(), 2);
        assert_eq!(cmds[0].kind, CommandType::Reliable);
        assert_eq!(cmds[0].payload, b"abc");
        assert_eq!(cmds[1].kind, CommandType::Fragment);
        assert_eq!(cmds[1].sequence_number, 1);
    }

    #[test]
    fn short_envelope_yields_nothing() {
        assert!(decode_envelope(&[0u8; 11]).is_empty());
        assert!(decode_envelope(&[]).is_empty());
    }

    #[test]
    fn overrunning_trailing_command_keeps_prefix() {
        let mut raw = envelope(&[(COMMAND_SEND_RELIABLE, b"ok")]);
        // Claim a second command whose declared length runs past the buffer.
        if let Some(count) = raw.get_mut(3) {
            *count = 2;
        }
        raw.extend_from_slice(&[COMMAND_SEND_RELIABLE, 1, 0, 0]);
        raw.extend_from_slice(&100u32.to_be_bytes());
        raw.extend_from_slice(&7u32.to_be_bytes());
        raw.extend_from_slice(b"xx"); // far less than declared

        let cmds = decode_envelope(&raw);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].payload, b"ok");
    }

    #[test]
    fn declared_length_below_header_stops_scan() {
        let mut raw = envelope(&[]);
        if let Some(count) = raw.get_mut(3) {
            *count = 1;
        }
        raw.extend_from_slice(&[COMMAND_SEND_RELIABLE, 1, 0, 0]);
        raw.extend_from_slice(&4u32.to_be_bytes()); // < 12
        raw.extend_from_slice(&0u32.to_be_bytes());
        assert!(decode_envelope(&raw).is_empty());
    }

    #[test]
    fn unknown_command_type_is_preserved() {
        let raw = envelope(&[(3, b"")]);
        let cmds = decode_envelope(&raw);
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].kind, CommandType::Other(3));
    }
}

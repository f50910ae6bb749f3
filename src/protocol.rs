//! Wire protocol for relay client/server communication.
//!
//! Wire format: `[type: u8][length: u32 big-endian][payload: UTF-8 text]`
//!
//! Clients send `Command` frames carrying one textual command line
//! (`/setName alice`, `/list`, ...). The server answers a command with a
//! `Reply` or `Error` frame and pushes `Message` and `Notice` frames
//! asynchronously, so a client waiting for a reply can tell the two apart.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use std::io;
use tokio::io::AsyncWriteExt;
use tokio_util::codec::Decoder;

/// Frame type byte values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Client → Server: one command line.
    Command = 0x01,
    /// Server → Client: answer to the last command.
    Reply = 0x02,
    /// Server → Client: relayed chat text.
    Message = 0x03,
    /// Server → Client: asynchronous notice (kick, shutdown, routing miss).
    Notice = 0x04,
    /// Server → Client: the last command was rejected.
    Error = 0x05,
}

impl FrameType {
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Command),
            0x02 => Some(Self::Reply),
            0x03 => Some(Self::Message),
            0x04 => Some(Self::Notice),
            0x05 => Some(Self::Error),
            _ => None,
        }
    }
}

/// Maximum frame payload size (64 KiB). Prevents OOM on malformed data.
pub const MAX_PAYLOAD_SIZE: u32 = 64 * 1024;

const HEADER_LEN: usize = 5;

/// A protocol frame with a type tag and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Create a frame carrying a text payload.
    pub fn text(frame_type: FrameType, text: impl Into<String>) -> Self {
        Self::new(frame_type, Bytes::from(text.into()))
    }

    /// Create a command frame from a parsed command.
    pub fn command(command: &Command) -> Self {
        Self::text(FrameType::Command, command.to_string())
    }

    /// Encode this frame into bytes.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.as_ref());
        buf.freeze()
    }

    /// Write this frame to an async writer.
    pub async fn write_to<W: AsyncWriteExt + Unpin + ?Sized>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode();
        writer.write_all(&encoded).await?;
        writer.flush().await
    }

    /// The payload as UTF-8 text.
    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        std::str::from_utf8(&self.payload).map_err(|_| ProtocolError::NotUtf8)
    }
}

/// Length-delimited decoder for [`Frame`]s.
///
/// Writes go through [`Frame::write_to`]. On the read side the codec is
/// used with `FramedRead`, which keeps
/// partially received frames buffered across reads (and across
/// `select!` cancellation).
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: u32,
}

impl FrameCodec {
    pub fn new(max_payload: u32) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let type_byte = src[0];
        let frame_type = FrameType::from_u8(type_byte).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown frame type: 0x{:02x}", type_byte),
            )
        })?;

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]);
        if length > self.max_payload {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame payload too large: {} bytes", length),
            ));
        }

        let total = HEADER_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(length as usize).freeze();
        Ok(Some(Frame {
            frame_type,
            payload,
        }))
    }
}

// ── Commands ───────────────────────────────────────────────────────

pub const IS_NAME_TAKEN: &str = "/isNameTaken";
pub const SET_NAME: &str = "/setName";
pub const SEND_TO: &str = "/SendMessageToThisClient";
pub const LIST: &str = "/list";
pub const EXIT: &str = "/exit";

/// Reply payloads. `ok` acknowledges `/setName` and
/// `/SendMessageToThisClient`.
pub const REPLY_TRUE: &str = "true";
pub const REPLY_FALSE: &str = "false";
pub const REPLY_OK: &str = "ok";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty command")]
    Empty,
    #[error("unknown command: {0}")]
    UnknownCommand(String),
    #[error("{command} requires a <{argument}> argument")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[error("payload is not valid UTF-8")]
    NotUtf8,
    #[error("unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
}

/// A client → server command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    IsNameTaken(String),
    SetName(String),
    SendTo { target: String, text: String },
    List,
    Exit,
}

impl Command {
    /// Parse one command line.
    ///
    /// The text of a directed message is everything after the single space
    /// that follows the target name, kept verbatim.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        match keyword {
            "" => Err(ProtocolError::Empty),
            IS_NAME_TAKEN => Ok(Self::IsNameTaken(name_arg(IS_NAME_TAKEN, rest)?)),
            SET_NAME => Ok(Self::SetName(name_arg(SET_NAME, rest)?)),
            SEND_TO => {
                let rest = rest.trim_start();
                let (target, text) = rest.split_once(' ').unwrap_or((rest, ""));
                if target.is_empty() {
                    return Err(ProtocolError::MissingArgument {
                        command: SEND_TO,
                        argument: "target",
                    });
                }
                if text.is_empty() {
                    return Err(ProtocolError::MissingArgument {
                        command: SEND_TO,
                        argument: "text",
                    });
                }
                Ok(Self::SendTo {
                    target: target.to_string(),
                    text: text.to_string(),
                })
            }
            // Trailing arguments are ignored; older clients append their
            // local endpoint to these two.
            LIST => Ok(Self::List),
            EXIT => Ok(Self::Exit),
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

fn name_arg(command: &'static str, rest: &str) -> Result<String, ProtocolError> {
    let name = rest.trim();
    if name.is_empty() {
        return Err(ProtocolError::MissingArgument {
            command,
            argument: "name",
        });
    }
    Ok(name.to_string())
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IsNameTaken(name) => write!(f, "{IS_NAME_TAKEN} {name}"),
            Self::SetName(name) => write!(f, "{SET_NAME} {name}"),
            Self::SendTo { target, text } => write!(f, "{SEND_TO} {target} {text}"),
            Self::List => f.write_str(LIST),
            Self::Exit => f.write_str(EXIT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> io::Result<Vec<Frame>> {
        let mut codec = FrameCodec::default();
        let mut buf = BytesMut::from(data);
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn frame_type_invalid_byte() {
        assert!(FrameType::from_u8(0xFF).is_none());
        assert!(FrameType::from_u8(0x00).is_none());
        assert!(FrameType::from_u8(0x06).is_none());
    }

    #[test]
    fn codec_decodes_encoded_frame() {
        let frame = Frame::text(FrameType::Message, "alice: hello world");
        let frames = decode_all(&frame.encode()).unwrap();
        assert_eq!(frames, vec![frame]);
    }

    #[test]
    fn codec_waits_for_complete_frame() {
        let encoded = Frame::text(FrameType::Reply, "false").encode();
        let mut codec = FrameCodec::default();

        let mut buf = BytesMut::from(&encoded[..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[3..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[7..]);
        let frame = codec.decode(&mut buf).unwrap().expect("frame should be complete");
        assert_eq!(frame.as_text().unwrap(), "false");
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_splits_back_to_back_frames() {
        let mut data = Vec::new();
        data.extend_from_slice(&Frame::text(FrameType::Message, "a: one").encode());
        data.extend_from_slice(&Frame::text(FrameType::Notice, "kicked").encode());
        data.extend_from_slice(&Frame::new(FrameType::Reply, Bytes::new()).encode());

        let frames = decode_all(&data).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameType::Message);
        assert_eq!(frames[1].as_text().unwrap(), "kicked");
        assert!(frames[2].payload.is_empty());
    }

    #[test]
    fn codec_rejects_unknown_type() {
        let err = decode_all(&[0xFF, 0x00, 0x00, 0x00, 0x00]).unwrap_err();
        assert!(err.to_string().contains("unknown frame type"));
    }

    #[test]
    fn codec_rejects_oversized_payload() {
        let mut codec = FrameCodec::new(8);
        let mut buf = BytesMut::from(&[0x01, 0x00, 0x00, 0x00, 0x09][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("too large"));
    }

    #[tokio::test]
    async fn write_to_produces_decodable_bytes() {
        let mut buf = Vec::new();
        Frame::command(&Command::List).write_to(&mut buf).await.unwrap();
        Frame::command(&Command::Exit).write_to(&mut buf).await.unwrap();

        let frames = decode_all(&buf).unwrap();
        assert_eq!(frames[0].as_text().unwrap(), "/list");
        assert_eq!(frames[1].as_text().unwrap(), "/exit");
    }

    #[test]
    fn as_text_rejects_invalid_utf8() {
        let frame = Frame::new(FrameType::Command, Bytes::from_static(&[0xC3, 0x28]));
        assert_eq!(frame.as_text(), Err(ProtocolError::NotUtf8));
    }

    #[test]
    fn parse_name_commands() {
        assert_eq!(
            Command::parse("/isNameTaken alice").unwrap(),
            Command::IsNameTaken("alice".to_string())
        );
        assert_eq!(
            Command::parse("/setName bob\r\n").unwrap(),
            Command::SetName("bob".to_string())
        );
        assert_eq!(
            Command::parse("/setName"),
            Err(ProtocolError::MissingArgument {
                command: SET_NAME,
                argument: "name",
            })
        );
    }

    #[test]
    fn parse_directed_message_keeps_text_verbatim() {
        let cmd = Command::parse("/SendMessageToThisClient bob  hi there,  bob! ").unwrap();
        assert_eq!(
            cmd,
            Command::SendTo {
                target: "bob".to_string(),
                text: " hi there,  bob! ".to_string(),
            }
        );
    }

    #[test]
    fn parse_directed_message_missing_parts() {
        assert!(matches!(
            Command::parse("/SendMessageToThisClient"),
            Err(ProtocolError::MissingArgument { argument: "target", .. })
        ));
        assert!(matches!(
            Command::parse("/SendMessageToThisClient bob"),
            Err(ProtocolError::MissingArgument { argument: "text", .. })
        ));
    }

    #[test]
    fn parse_list_and_exit_ignore_trailing_endpoint() {
        assert_eq!(Command::parse("/list").unwrap(), Command::List);
        assert_eq!(Command::parse("/list 10.0.0.5:51234").unwrap(), Command::List);
        assert_eq!(Command::parse("/exit 10.0.0.5:51234").unwrap(), Command::Exit);
    }

    #[test]
    fn parse_unknown_and_empty() {
        assert_eq!(
            Command::parse("/dance now"),
            Err(ProtocolError::UnknownCommand("/dance".to_string()))
        );
        assert_eq!(Command::parse("hello"), Err(ProtocolError::UnknownCommand("hello".to_string())));
        assert_eq!(Command::parse(""), Err(ProtocolError::Empty));
    }

    #[test]
    fn display_renders_parseable_lines() {
        let commands = [
            Command::IsNameTaken("carol".to_string()),
            Command::SetName("carol".to_string()),
            Command::SendTo {
                target: "dave".to_string(),
                text: "see you at 5".to_string(),
            },
            Command::List,
            Command::Exit,
        ];
        for cmd in commands {
            assert_eq!(Command::parse(&cmd.to_string()).unwrap(), cmd);
        }
    }
}

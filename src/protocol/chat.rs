//! Chat message payload codec
//!
//! Length-prefixed string layout carried inside CHAT_MESSAGE packets.

use super::packet::CodecError;
use serde::{Deserialize, Serialize};

/// Chat payload flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatFlags(u8);

impl ChatFlags {
    pub const NONE: Self = Self(0x00);
    /// Message was relayed; the original sender nickname rides along
    pub const HAS_ORIGINAL_SENDER: Self = Self(0x01);
    /// Directed message; the recipient nickname rides along
    pub const IS_PRIVATE: Self = Self(0x02);

    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    pub const fn as_u8(self) -> u8 {
        self.0
    }

    pub const fn has_original_sender(self) -> bool {
        self.0 & Self::HAS_ORIGINAL_SENDER.0 != 0
    }

    pub const fn is_private(self) -> bool {
        self.0 & Self::IS_PRIVATE.0 != 0
    }
}

/// Application-level chat message
///
/// `id` is a UUID-like string unique per origin; dedup and delivery acks
/// key on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub timestamp_ms: u64,
    pub id: String,
    pub sender: String,
    pub content: String,
    pub original_sender: Option<String>,
    pub recipient_nickname: Option<String>,
}

impl ChatMessage {
    pub fn new(id: String, sender: String, content: String, timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            id,
            sender,
            content,
            original_sender: None,
            recipient_nickname: None,
        }
    }

    pub fn private_to(mut self, recipient_nickname: String) -> Self {
        self.recipient_nickname = Some(recipient_nickname);
        self
    }

    pub fn relayed_from(mut self, original_sender: String) -> Self {
        self.original_sender = Some(original_sender);
        self
    }

    fn flags(&self) -> ChatFlags {
        let mut flags = ChatFlags::NONE.as_u8();
        if self.original_sender.is_some() {
            flags |= ChatFlags::HAS_ORIGINAL_SENDER.as_u8();
        }
        if self.recipient_nickname.is_some() {
            flags |= ChatFlags::IS_PRIVATE.as_u8();
        }
        ChatFlags::new(flags)
    }

    /// Encode to the wire payload layout
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.id.len() > u8::MAX as usize || self.sender.len() > u8::MAX as usize {
            return Err(CodecError::PayloadTooLarge);
        }
        if self.content.len() > u16::MAX as usize {
            return Err(CodecError::PayloadTooLarge);
        }

        let mut bytes = Vec::with_capacity(12 + self.id.len() + self.sender.len() + self.content.len());
        bytes.push(self.flags().as_u8());
        bytes.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        write_str_u8(&mut bytes, &self.id);
        write_str_u8(&mut bytes, &self.sender);
        bytes.extend_from_slice(&(self.content.len() as u16).to_be_bytes());
        bytes.extend_from_slice(self.content.as_bytes());
        if let Some(original) = &self.original_sender {
            if original.len() > u8::MAX as usize {
                return Err(CodecError::PayloadTooLarge);
            }
            write_str_u8(&mut bytes, original);
        }
        if let Some(nickname) = &self.recipient_nickname {
            if nickname.len() > u8::MAX as usize {
                return Err(CodecError::PayloadTooLarge);
            }
            write_str_u8(&mut bytes, nickname);
        }
        Ok(bytes)
    }

    /// Decode from the wire payload layout
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut cursor = Cursor::new(bytes);
        let flags = ChatFlags::new(cursor.read_u8()?);
        let timestamp_ms = cursor.read_u64()?;
        let id = cursor.read_str_u8()?;
        let sender = cursor.read_str_u8()?;
        let content = cursor.read_str_u16()?;
        let original_sender = if flags.has_original_sender() {
            Some(cursor.read_str_u8()?)
        } else {
            None
        };
        let recipient_nickname = if flags.is_private() {
            Some(cursor.read_str_u8()?)
        } else {
            None
        };

        Ok(Self {
            timestamp_ms,
            id,
            sender,
            content,
            original_sender,
            recipient_nickname,
        })
    }
}

fn write_str_u8(bytes: &mut Vec<u8>, value: &str) {
    bytes.push(value.len() as u8);
    bytes.extend_from_slice(value.as_bytes());
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.bytes.len() < self.offset + len {
            return Err(CodecError::Truncated("chat payload".into()));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let slice = self.take(8)?;
        Ok(u64::from_be_bytes(slice.try_into().expect("8-byte slice")))
    }

    fn read_str_u8(&mut self) -> Result<String, CodecError> {
        let len = self.read_u8()? as usize;
        let slice = self.take(len)?;
        String::from_utf8(slice.to_vec())
            .map_err(|_| CodecError::Truncated("invalid utf-8 in chat field".into()))
    }

    fn read_str_u16(&mut self) -> Result<String, CodecError> {
        let slice = self.take(2)?;
        let len = u16::from_be_bytes(slice.try_into().expect("2-byte slice")) as usize;
        let slice = self.take(len)?;
        String::from_utf8(slice.to_vec())
            .map_err(|_| CodecError::Truncated("invalid utf-8 in chat content".into()))
    }
}

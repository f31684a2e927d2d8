/// Frames larger than this abort the connection. Generous enough for a
/// full block plus header and for bitfields of very large torrents.
pub const MAX_FRAME_LEN: usize = 10 * 16384;

/// IDs of the messages defined in the protocol.
#[derive(PartialEq, Eq, Debug, Clone, Copy)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

/// A wire message, decoded from or encoded into a length-prefixed frame.
///
/// Keep-alive is the empty frame (length 0, no type byte).
#[derive(PartialEq, Debug, Clone)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield(Vec<u8>),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    Port(u16),
    /// BEP-10 extended message: negotiated subtype plus its payload
    /// (bencoded for the handshake and for PEX).
    Extended {
        id: u8,
        payload: Vec<u8>,
    },
}

/// Posible message codec errors. Any of them is a protocol error that
/// aborts the connection.
#[derive(Debug, PartialEq)]
pub enum MessageError {
    FrameTooLong(usize),
    UnknownMessageId(u8),
    PayloadLengthMismatch(MessageId),
}

impl Message {
    /// Decodes one message from the front of the buffer.
    ///
    /// Returns the message together with the number of bytes consumed,
    /// or `None` (zero bytes consumed) when the buffer does not yet
    /// hold a complete frame.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, MessageError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if len == 0 {
            return Ok(Some((Message::KeepAlive, 4)));
        }
        if len > MAX_FRAME_LEN {
            return Err(MessageError::FrameTooLong(len));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }

        let payload = &buf[5..4 + len];
        let message = match buf[4] {
            0 => Self::expect_empty(MessageId::Choke, payload, Message::Choke)?,
            1 => Self::expect_empty(MessageId::Unchoke, payload, Message::Unchoke)?,
            2 => Self::expect_empty(MessageId::Interested, payload, Message::Interested)?,
            3 => Self::expect_empty(MessageId::NotInterested, payload, Message::NotInterested)?,
            4 => Message::Have {
                index: Self::read_u32(MessageId::Have, payload, 0, len - 1, 4)?,
            },
            5 => Message::Bitfield(payload.to_vec()),
            6 => Message::Request {
                index: Self::read_u32(MessageId::Request, payload, 0, len - 1, 12)?,
                begin: Self::read_u32(MessageId::Request, payload, 4, len - 1, 12)?,
                length: Self::read_u32(MessageId::Request, payload, 8, len - 1, 12)?,
            },
            7 => {
                if payload.len() < 8 {
                    return Err(MessageError::PayloadLengthMismatch(MessageId::Piece));
                }
                Message::Piece {
                    index: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
                    begin: u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]]),
                    block: payload[8..].to_vec(),
                }
            }
            8 => Message::Cancel {
                index: Self::read_u32(MessageId::Cancel, payload, 0, len - 1, 12)?,
                begin: Self::read_u32(MessageId::Cancel, payload, 4, len - 1, 12)?,
                length: Self::read_u32(MessageId::Cancel, payload, 8, len - 1, 12)?,
            },
            9 => {
                if payload.len() != 2 {
                    return Err(MessageError::PayloadLengthMismatch(MessageId::Port));
                }
                Message::Port(u16::from_be_bytes([payload[0], payload[1]]))
            }
            20 => {
                if payload.is_empty() {
                    return Err(MessageError::PayloadLengthMismatch(MessageId::Extended));
                }
                Message::Extended {
                    id: payload[0],
                    payload: payload[1..].to_vec(),
                }
            }
            other => return Err(MessageError::UnknownMessageId(other)),
        };

        Ok(Some((message, 4 + len)))
    }

    fn expect_empty(
        id: MessageId,
        payload: &[u8],
        message: Message,
    ) -> Result<Message, MessageError> {
        if payload.is_empty() {
            Ok(message)
        } else {
            Err(MessageError::PayloadLengthMismatch(id))
        }
    }

    fn read_u32(
        id: MessageId,
        payload: &[u8],
        at: usize,
        actual_len: usize,
        expected_len: usize,
    ) -> Result<u32, MessageError> {
        if actual_len != expected_len {
            return Err(MessageError::PayloadLengthMismatch(id));
        }
        Ok(u32::from_be_bytes([
            payload[at],
            payload[at + 1],
            payload[at + 2],
            payload[at + 3],
        ]))
    }

    /// Encodes the message as a length-prefixed frame.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (id, payload) = match self {
            Message::KeepAlive => return 0u32.to_be_bytes().to_vec(),
            Message::Choke => (MessageId::Choke, vec![]),
            Message::Unchoke => (MessageId::Unchoke, vec![]),
            Message::Interested => (MessageId::Interested, vec![]),
            Message::NotInterested => (MessageId::NotInterested, vec![]),
            Message::Have { index } => (MessageId::Have, index.to_be_bytes().to_vec()),
            Message::Bitfield(bits) => (MessageId::Bitfield, bits.clone()),
            Message::Request {
                index,
                begin,
                length,
            } => (
                MessageId::Request,
                Self::block_descriptor(*index, *begin, *length),
            ),
            Message::Piece {
                index,
                begin,
                block,
            } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend(index.to_be_bytes());
                payload.extend(begin.to_be_bytes());
                payload.extend(block);
                (MessageId::Piece, payload)
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => (
                MessageId::Cancel,
                Self::block_descriptor(*index, *begin, *length),
            ),
            Message::Port(port) => (MessageId::Port, port.to_be_bytes().to_vec()),
            Message::Extended { id, payload } => {
                let mut bytes = Vec::with_capacity(1 + payload.len());
                bytes.push(*id);
                bytes.extend(payload);
                (MessageId::Extended, bytes)
            }
        };

        let len = payload.len() + 1;
        let mut bytes = Vec::with_capacity(4 + len);
        bytes.extend((len as u32).to_be_bytes());
        bytes.push(id as u8);
        bytes.extend(payload);
        bytes
    }

    fn block_descriptor(index: u32, begin: u32, length: u32) -> Vec<u8> {
        let mut bytes = vec![0; 12];
        bytes[0..4].copy_from_slice(&index.to_be_bytes());
        bytes[4..8].copy_from_slice(&begin.to_be_bytes());
        bytes[8..12].copy_from_slice(&length.to_be_bytes());
        bytes
    }
}

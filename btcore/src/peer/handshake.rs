use crate::torrent::TorrentId;

/// Posible handshake parsing errors.
#[derive(Debug, PartialEq)]
pub enum HandshakeError {
    InvalidLength(usize),
    InvalidProtocolString,
}

const PSTR: &str = "BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// Byte 5 of the reserved area, bit 20 counted from the last bit:
/// advertises BEP-10 extended messaging.
const EXTENDED_MESSAGING_BYTE: usize = 5;
const EXTENDED_MESSAGING_BIT: u8 = 0x10;

/// The first message of a connection, sent before any framed traffic.
#[derive(Debug, Clone, PartialEq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: TorrentId,
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Creates an outgoing handshake advertising extended messaging.
    pub fn new(info_hash: TorrentId, peer_id: [u8; 20]) -> Self {
        let mut reserved = [0u8; 8];
        reserved[EXTENDED_MESSAGING_BYTE] |= EXTENDED_MESSAGING_BIT;
        Self {
            reserved,
            info_hash,
            peer_id,
        }
    }

    /// Whether the remote advertised BEP-10 extended messaging.
    pub fn supports_extended_messaging(&self) -> bool {
        self.reserved[EXTENDED_MESSAGING_BYTE] & EXTENDED_MESSAGING_BIT != 0
    }

    /// Converts the `Handshake` to its 68-byte wire form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![PSTR.len() as u8];
        bytes.extend(PSTR.as_bytes());
        bytes.extend(&self.reserved);
        bytes.extend(self.info_hash.as_bytes());
        bytes.extend(&self.peer_id);
        bytes
    }

    /// Parses a 68-byte buffer into a `Handshake`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, HandshakeError> {
        if bytes.len() != HANDSHAKE_LEN {
            return Err(HandshakeError::InvalidLength(bytes.len()));
        }
        if bytes[0] as usize != PSTR.len() || &bytes[1..20] != PSTR.as_bytes() {
            return Err(HandshakeError::InvalidProtocolString);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&bytes[20..28]);

        let info_hash = TorrentId::from_bytes(&bytes[28..48])
            .map_err(|_| HandshakeError::InvalidLength(bytes.len()))?;

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&bytes[48..68]);

        Ok(Self {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

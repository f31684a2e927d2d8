use std::collections::BTreeMap;

use bencoder::bencode::{Bencode, BencodeError, ToBencode};

use crate::config::cfg::Cfg;

/// Subtype of the extended handshake itself.
pub const EXTENDED_HANDSHAKE_ID: u8 = 0;

/// Extension name of Peer Exchange.
pub const UT_PEX: &str = "ut_pex";

/// The subtype id this side assigns to incoming PEX messages.
pub const LOCAL_UT_PEX_ID: u8 = 1;

const CLIENT_VERSION: &str = "btcore 0.1.0";

/// Posible extended handshake errors.
#[derive(Debug, PartialEq)]
pub enum ExtendedHandshakeError {
    Bencode(BencodeError),
    NotADict,
    InvalidExtensionMap,
}

/// BEP-10 extended handshake dictionary.
///
/// Known keys get typed fields; anything else is kept opaquely so an
/// echo of the handshake reproduces it byte for byte.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtendedHandshake {
    /// `m`: extension name to negotiated subtype id.
    pub extensions: BTreeMap<String, u8>,
    /// `p`: the remote's TCP listen port.
    pub port: Option<u16>,
    /// `v`: human-readable client version.
    pub version: Option<String>,
    /// `metadata_size`: size of the info dictionary, for metadata exchange.
    pub metadata_size: Option<i64>,
    /// `e`: encryption flag.
    pub encryption: Option<u8>,
    unknown: BTreeMap<Vec<u8>, Bencode>,
}

impl ExtendedHandshake {
    /// Builds the local handshake from the configuration.
    pub fn local(config: &Cfg) -> Self {
        let mut extensions = BTreeMap::new();
        extensions.insert(UT_PEX.to_string(), LOCAL_UT_PEX_ID);

        Self {
            extensions,
            port: Some(config.tcp_port),
            version: Some(CLIENT_VERSION.to_string()),
            metadata_size: None,
            encryption: Some(config.encryption_policy.handshake_flag()),
            unknown: BTreeMap::new(),
        }
    }

    /// Parses a bencoded handshake payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, ExtendedHandshakeError> {
        let bencode = Bencode::decode(payload).map_err(ExtendedHandshakeError::Bencode)?;
        let dict = bencode
            .as_dict()
            .ok_or(ExtendedHandshakeError::NotADict)?
            .clone();

        let mut handshake = Self::default();
        for (key, value) in dict {
            match key.as_slice() {
                b"m" => {
                    let map = value
                        .as_dict()
                        .ok_or(ExtendedHandshakeError::InvalidExtensionMap)?;
                    for (name, id) in map {
                        let name = String::from_utf8(name.clone())
                            .map_err(|_| ExtendedHandshakeError::InvalidExtensionMap)?;
                        let id = id
                            .as_number()
                            .ok_or(ExtendedHandshakeError::InvalidExtensionMap)?;
                        handshake.extensions.insert(name, id as u8);
                    }
                }
                b"p" => handshake.port = value.as_number().map(|p| p as u16),
                b"v" => {
                    handshake.version = value
                        .as_bytes()
                        .map(|v| String::from_utf8_lossy(v).to_string())
                }
                b"metadata_size" => handshake.metadata_size = value.as_number(),
                b"e" => handshake.encryption = value.as_number().map(|e| e as u8),
                _ => {
                    handshake.unknown.insert(key, value);
                }
            }
        }
        Ok(handshake)
    }

    /// Encodes the handshake, unknown keys included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Bencode> = self.unknown.clone();

        let mut extensions = BTreeMap::new();
        for (name, id) in &self.extensions {
            extensions.insert(name.as_bytes().to_vec(), (*id).to_bencode());
        }
        dict.insert(b"m".to_vec(), Bencode::BDict(extensions));

        if let Some(port) = self.port {
            dict.insert(b"p".to_vec(), port.to_bencode());
        }
        if let Some(version) = &self.version {
            dict.insert(b"v".to_vec(), version.to_bencode());
        }
        if let Some(metadata_size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), metadata_size.to_bencode());
        }
        if let Some(encryption) = self.encryption {
            dict.insert(b"e".to_vec(), encryption.to_bencode());
        }

        Bencode::encode(&dict)
    }

    /// Folds a later handshake into this one.
    ///
    /// The exchange is additive: extensions can be added or renumbered
    /// but an advertised extension never disappears, so absence in a
    /// later handshake is not treated as a disable.
    pub fn merge(&mut self, newer: ExtendedHandshake) {
        for (name, id) in newer.extensions {
            self.extensions.insert(name, id);
        }
        if newer.port.is_some() {
            self.port = newer.port;
        }
        if newer.version.is_some() {
            self.version = newer.version;
        }
        if newer.metadata_size.is_some() {
            self.metadata_size = newer.metadata_size;
        }
        if newer.encryption.is_some() {
            self.encryption = newer.encryption;
        }
        for (key, value) in newer.unknown {
            self.unknown.insert(key, value);
        }
    }

    /// The subtype the remote wants PEX messages sent under.
    pub fn ut_pex_id(&self) -> Option<u8> {
        self.extensions.get(UT_PEX).copied()
    }
}

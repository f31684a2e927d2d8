use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Port value for peers discovered without one (e.g. from an incoming
/// connection behind a NAT).
pub const PORT_UNKNOWN: u16 = 0;

/// Option flags a peer is known to support, gossiped in PEX `added.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PeerOptions(u8);

impl PeerOptions {
    const ENCRYPTION: u8 = 0x01;
    const SEED: u8 = 0x02;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_flags(flags: u8) -> Self {
        Self(flags & (Self::ENCRYPTION | Self::SEED))
    }

    pub fn with_encryption(mut self) -> Self {
        self.0 |= Self::ENCRYPTION;
        self
    }

    pub fn with_seed(mut self) -> Self {
        self.0 |= Self::SEED;
        self
    }

    pub fn supports_encryption(&self) -> bool {
        self.0 & Self::ENCRYPTION != 0
    }

    pub fn is_seed(&self) -> bool {
        self.0 & Self::SEED != 0
    }

    pub fn flags(&self) -> u8 {
        self.0
    }
}

/// Posible peer decoding errors.
#[derive(Debug, PartialEq)]
pub enum PeerError {
    InvalidCompactLength(usize),
}

/// A peer endpoint as discovered by a peer source.
///
/// Identity is the endpoint: equality and hashing ignore the option
/// flags so a rediscovered peer with new flags collapses onto the same
/// entry.
#[derive(Debug, Clone, Copy)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
    pub options: PeerOptions,
}

impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        self.ip == other.ip && self.port == other.port
    }
}

impl Eq for Peer {}

impl std::hash::Hash for Peer {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.ip.hash(state);
        self.port.hash(state);
    }
}

impl Peer {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            options: PeerOptions::new(),
        }
    }

    pub fn with_options(ip: IpAddr, port: u16, options: PeerOptions) -> Self {
        Self { ip, port, options }
    }

    pub fn is_ipv4(&self) -> bool {
        self.ip.is_ipv4()
    }

    /// Whether this peer refers to the same remote as `other`.
    ///
    /// The address must match; ports must match too unless one side
    /// never learned the real listen port.
    pub fn is_same_endpoint(&self, other: &Peer) -> bool {
        if self.ip != other.ip {
            return false;
        }
        self.port == other.port || self.port == PORT_UNKNOWN || other.port == PORT_UNKNOWN
    }

    /// Packs the endpoint into the compact form used by PEX lists:
    /// 4 (or 16) address bytes followed by a big-endian port.
    pub fn to_compact(&self) -> Vec<u8> {
        let mut bytes = match self.ip {
            IpAddr::V4(ip) => ip.octets().to_vec(),
            IpAddr::V6(ip) => ip.octets().to_vec(),
        };
        bytes.extend(self.port.to_be_bytes());
        bytes
    }

    /// Reads one compact IPv4 endpoint (6 bytes).
    pub fn from_compact_v4(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != 6 {
            return Err(PeerError::InvalidCompactLength(bytes.len()));
        }
        let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
        let port = u16::from_be_bytes([bytes[4], bytes[5]]);
        Ok(Self::new(IpAddr::V4(ip), port))
    }

    /// Reads one compact IPv6 endpoint (18 bytes).
    pub fn from_compact_v6(bytes: &[u8]) -> Result<Self, PeerError> {
        if bytes.len() != 18 {
            return Err(PeerError::InvalidCompactLength(bytes.len()));
        }
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[..16]);
        let port = u16::from_be_bytes([bytes[16], bytes[17]]);
        Ok(Self::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

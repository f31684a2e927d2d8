use std::collections::BTreeMap;

use bencoder::bencode::{Bencode, BencodeError};

use crate::peer::peer::{Peer, PeerOptions};

/// Posible PEX message codec errors.
#[derive(Debug, PartialEq)]
pub enum PexMessageError {
    Bencode(BencodeError),
    NotADict,
    MalformedPeerList(&'static str),
}

/// A `ut_pex` gossip message: endpoints recently added to and dropped
/// from the torrent's swarm.
///
/// On the wire the lists are compact: 6 bytes per IPv4 peer in `added`
/// / `dropped`, 18 per IPv6 peer in `added6` / `dropped6`, one flag
/// byte per added peer in `added.f` / `added6.f`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PexMessage {
    pub added: Vec<Peer>,
    pub dropped: Vec<Peer>,
}

impl PexMessage {
    pub fn new(added: Vec<Peer>, dropped: Vec<Peer>) -> Self {
        Self { added, dropped }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.dropped.is_empty()
    }

    /// Encodes the bencoded payload carried under the negotiated
    /// `ut_pex` extended-message id.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dict: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();

        let (added4, added6): (Vec<&Peer>, Vec<&Peer>) =
            self.added.iter().partition(|peer| peer.is_ipv4());
        let (dropped4, dropped6): (Vec<&Peer>, Vec<&Peer>) =
            self.dropped.iter().partition(|peer| peer.is_ipv4());

        dict.insert(b"added".to_vec(), Self::compact_list(&added4));
        dict.insert(
            b"added.f".to_vec(),
            Bencode::BString(added4.iter().map(|peer| peer.options.flags()).collect()),
        );
        dict.insert(b"dropped".to_vec(), Self::compact_list(&dropped4));

        if !added6.is_empty() || !dropped6.is_empty() {
            dict.insert(b"added6".to_vec(), Self::compact_list(&added6));
            dict.insert(
                b"added6.f".to_vec(),
                Bencode::BString(added6.iter().map(|peer| peer.options.flags()).collect()),
            );
            dict.insert(b"dropped6".to_vec(), Self::compact_list(&dropped6));
        }

        Bencode::encode(&dict)
    }

    fn compact_list(peers: &[&Peer]) -> Bencode {
        let mut bytes = Vec::new();
        for peer in peers {
            bytes.extend(peer.to_compact());
        }
        Bencode::BString(bytes)
    }

    /// Decodes a received `ut_pex` payload.
    pub fn from_bytes(payload: &[u8]) -> Result<Self, PexMessageError> {
        let bencode = Bencode::decode(payload).map_err(PexMessageError::Bencode)?;
        let dict = bencode.as_dict().ok_or(PexMessageError::NotADict)?;

        let mut added = Self::parse_list(dict, b"added", 6)?;
        let added_flags = dict
            .get(b"added.f".as_slice())
            .and_then(|value| value.as_bytes());
        if let Some(flags) = added_flags {
            for (peer, flag) in added.iter_mut().zip(flags) {
                peer.options = PeerOptions::from_flags(*flag);
            }
        }

        let mut added6 = Self::parse_list(dict, b"added6", 18)?;
        let added6_flags = dict
            .get(b"added6.f".as_slice())
            .and_then(|value| value.as_bytes());
        if let Some(flags) = added6_flags {
            for (peer, flag) in added6.iter_mut().zip(flags) {
                peer.options = PeerOptions::from_flags(*flag);
            }
        }
        added.extend(added6);

        let mut dropped = Self::parse_list(dict, b"dropped", 6)?;
        dropped.extend(Self::parse_list(dict, b"dropped6", 18)?);

        Ok(Self { added, dropped })
    }

    fn parse_list(
        dict: &BTreeMap<Vec<u8>, Bencode>,
        key: &[u8],
        stride: usize,
    ) -> Result<Vec<Peer>, PexMessageError> {
        let bytes = match dict.get(key).and_then(|value| value.as_bytes()) {
            Some(bytes) => bytes,
            None => return Ok(vec![]),
        };
        if bytes.len() % stride != 0 {
            return Err(PexMessageError::MalformedPeerList(
                "compact list length not a multiple of the entry size",
            ));
        }

        let mut peers = Vec::with_capacity(bytes.len() / stride);
        for chunk in bytes.chunks(stride) {
            let peer = if stride == 6 {
                Peer::from_compact_v4(chunk)
            } else {
                Peer::from_compact_v6(chunk)
            }
            .map_err(|_| PexMessageError::MalformedPeerList("bad compact endpoint"))?;
            peers.push(peer);
        }
        Ok(peers)
    }
}

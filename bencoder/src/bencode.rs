use std::collections::BTreeMap;

/// A bencoded value.
///
/// Dictionaries keep their keys sorted, which is what the canonical
/// encoding requires.
#[derive(PartialEq, Debug, Clone)]
pub enum Bencode {
    BNumber(i64),
    BString(Vec<u8>),
    BList(Vec<Bencode>),
    BDict(BTreeMap<Vec<u8>, Bencode>),
}

/// Posible bencode decoding errors.
#[derive(PartialEq, Debug)]
pub enum BencodeError {
    UnexpectedEndOfInput,
    InvalidBencodeType,
    InvalidBencodeNumber,
    InvalidBencodeString,
    InvalidBencodeDict,
    TrailingData(usize),
}

pub trait ToBencode {
    fn to_bencode(&self) -> Bencode;
}

impl ToBencode for String {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for &str {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.as_bytes().to_vec())
    }
}

impl ToBencode for i64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber(*self)
    }
}

impl ToBencode for u64 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self) as i64)
    }
}

impl ToBencode for u32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for u16 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for u8 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for i32 {
    fn to_bencode(&self) -> Bencode {
        Bencode::BNumber((*self).into())
    }
}

impl ToBencode for Vec<u8> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BString(self.clone())
    }
}

impl ToBencode for BTreeMap<Vec<u8>, Bencode> {
    fn to_bencode(&self) -> Bencode {
        Bencode::BDict(self.clone())
    }
}

impl ToBencode for Bencode {
    fn to_bencode(&self) -> Bencode {
        self.clone()
    }
}

impl Bencode {
    /// Decodes a full bencoded buffer into a `Bencode` value.
    ///
    /// The whole input must be consumed; leftover bytes return
    /// `BencodeError::TrailingData` with the consumed count.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// let bencode = Bencode::decode(b"5:hello").unwrap();
    /// assert_eq!(bencode, Bencode::BString(b"hello".to_vec()));
    ///
    /// let bencode = Bencode::decode(b"i123e").unwrap();
    /// assert_eq!(bencode, Bencode::BNumber(123));
    /// ```
    pub fn decode(data: &[u8]) -> Result<Bencode, BencodeError> {
        let (bencode, consumed) = Bencode::do_decode(data)?;
        if consumed != data.len() {
            return Err(BencodeError::TrailingData(consumed));
        }
        Ok(bencode)
    }

    /// Decodes one bencoded value from the front of the buffer and
    /// returns it together with the number of bytes consumed.
    ///
    /// Trailing bytes are left for the caller, which is what wire
    /// payloads that append raw data after a dictionary need.
    pub fn decode_prefix(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        Bencode::do_decode(data)
    }

    fn do_decode(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        match data.first() {
            None => Err(BencodeError::UnexpectedEndOfInput),
            Some(b'i') => Bencode::decode_number(data),
            Some(b'l') => Bencode::decode_list(data),
            Some(b'd') => Bencode::decode_dict(data),
            Some(b'0'..=b'9') => Bencode::decode_string(data),
            Some(_) => Err(BencodeError::InvalidBencodeType),
        }
    }

    fn decode_string(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let colon = data
            .iter()
            .position(|b| *b == b':')
            .ok_or(BencodeError::UnexpectedEndOfInput)?;

        let length = std::str::from_utf8(&data[..colon])
            .map_err(|_| BencodeError::InvalidBencodeString)?
            .parse::<usize>()
            .map_err(|_| BencodeError::InvalidBencodeString)?;

        let start = colon + 1;
        let end = start
            .checked_add(length)
            .ok_or(BencodeError::InvalidBencodeString)?;
        if end > data.len() {
            return Err(BencodeError::UnexpectedEndOfInput);
        }

        Ok((Bencode::BString(data[start..end].to_vec()), end))
    }

    fn decode_number(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let end = data
            .iter()
            .position(|b| *b == b'e')
            .ok_or(BencodeError::UnexpectedEndOfInput)?;

        let number = std::str::from_utf8(&data[1..end])
            .map_err(|_| BencodeError::InvalidBencodeNumber)?
            .parse::<i64>()
            .map_err(|_| BencodeError::InvalidBencodeNumber)?;

        Ok((Bencode::BNumber(number), end + 1))
    }

    fn decode_list(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut list = Vec::new();
        loop {
            match data.get(i) {
                None => return Err(BencodeError::UnexpectedEndOfInput),
                Some(b'e') => break,
                Some(_) => {
                    let (value, size) = Bencode::do_decode(&data[i..])?;
                    list.push(value);
                    i += size;
                }
            }
        }
        Ok((Bencode::BList(list), i + 1))
    }

    fn decode_dict(data: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let mut i = 1;
        let mut dict = BTreeMap::new();
        loop {
            match data.get(i) {
                None => return Err(BencodeError::UnexpectedEndOfInput),
                Some(b'e') => break,
                Some(_) => {
                    let (key, size) = Bencode::do_decode(&data[i..])?;
                    i += size;
                    let (value, size) = Bencode::do_decode(&data[i..])?;
                    i += size;
                    match key {
                        Bencode::BString(key) => dict.insert(key, value),
                        _ => return Err(BencodeError::InvalidBencodeDict),
                    };
                }
            }
        }
        Ok((Bencode::BDict(dict), i + 1))
    }

    /// Encodes a value into bencoded bytes.
    ///
    /// # Example
    ///
    /// ```rust
    /// use bencoder::bencode::Bencode;
    ///
    /// let encoded = Bencode::encode(&String::from("spam"));
    /// assert_eq!(encoded, b"4:spam");
    ///
    /// let encoded = Bencode::encode(&123i64);
    /// assert_eq!(encoded, b"i123e");
    /// ```
    pub fn encode(bencode: &dyn ToBencode) -> Vec<u8> {
        let bencode = bencode.to_bencode();
        Bencode::do_encode(&bencode)
    }

    fn do_encode(bencode: &Bencode) -> Vec<u8> {
        match bencode {
            Bencode::BNumber(n) => format!("i{}e", n).into_bytes(),
            Bencode::BString(s) => {
                let mut bytes = format!("{}:", s.len()).into_bytes();
                bytes.extend_from_slice(s);
                bytes
            }
            Bencode::BList(l) => {
                let mut bytes = vec![b'l'];
                for value in l {
                    bytes.extend(Bencode::do_encode(value));
                }
                bytes.push(b'e');
                bytes
            }
            Bencode::BDict(d) => {
                let mut bytes = vec![b'd'];
                for (key, value) in d {
                    bytes.extend(Bencode::do_encode(&Bencode::BString(key.clone())));
                    bytes.extend(Bencode::do_encode(value));
                }
                bytes.push(b'e');
                bytes
            }
        }
    }

    /// Returns the dictionary entries if this value is a dict.
    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Bencode>> {
        match self {
            Bencode::BDict(d) => Some(d),
            _ => None,
        }
    }

    /// Returns the number if this value is a number.
    pub fn as_number(&self) -> Option<i64> {
        match self {
            Bencode::BNumber(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the byte string if this value is a string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::BString(s) => Some(s),
            _ => None,
        }
    }
}

use core::fmt;

/// On-chain identity of a contract.
///
/// Addresses are printable ASCII tokens assigned by the host chain. The
/// engine treats them as opaque: it never derives one, it only carries them
/// between the host, the identity stack and the storage track.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContractAddress(String);

pub const MAX_ADDRESS_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseAddressError {
    Empty,
    TooLong(usize),
    InvalidCharacter(char),
    InvalidHex,
}

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl ContractAddress {
    pub fn new(s: impl Into<String>) -> Result<Self, ParseAddressError> {
        let s = s.into();
        if s.is_empty() {
            return Err(ParseAddressError::Empty);
        }
        if s.len() > MAX_ADDRESS_LEN {
            return Err(ParseAddressError::TooLong(s.len()));
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_graphic()) {
            return Err(ParseAddressError::InvalidCharacter(c));
        }
        Ok(Self(s))
    }

    /// Decodes the `<hex>` payload of an `@address:<hex>` module name.
    pub fn from_hex(hex_str: &str) -> Result<Self, ParseAddressError> {
        let bytes = hex::decode(hex_str).map_err(|_| ParseAddressError::InvalidHex)?;
        let s = String::from_utf8(bytes).map_err(|_| ParseAddressError::InvalidHex)?;
        Self::new(s)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContractAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ContractAddress {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid hex: {0}")]
pub struct InvalidHex(hex::FromHexError);

/// A byte string in lower-case hex encoding. Preimages, payment hashes, and
/// macaroons travel through the crate in this form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hex(String);

impl Hex {
    pub fn encode(data: &[u8]) -> Self {
        Hex(hex::encode(data))
    }

    /// Accepts hex in either case and normalizes it to lower case.
    pub fn parse(s: &str) -> Result<Self, InvalidHex> {
        hex::decode(s).map_err(InvalidHex)?;
        Ok(Hex(s.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Hex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_lower_case() {
        assert_eq!(Hex::encode(&[0xAB, 0x01]).as_str(), "ab01");
    }

    #[test]
    fn parse_normalizes_case() {
        assert_eq!(Hex::parse("AB01").unwrap(), Hex::encode(&[0xAB, 0x01]));
        assert!(Hex::parse("not hex").is_err());
    }
}

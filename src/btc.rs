//! This module contains definitions for Bitcoin-specific entities and routines.

use std::ops::{Add, AddAssign, Sub, SubAssign};

#[cfg(all(feature = "mainnet", feature = "testnet"))]
compile_error!("mainnet and testnet cannot be enabled at the same time");

#[cfg(feature = "mainnet")]
pub const NETWORK: bitcoin::Network = bitcoin::Network::Bitcoin;

#[cfg(feature = "testnet")]
pub const NETWORK: bitcoin::Network = bitcoin::Network::Testnet;

#[cfg(all(not(feature = "mainnet"), not(feature = "testnet")))]
pub const NETWORK: bitcoin::Network = bitcoin::Network::Regtest;

pub use bitcoin::Address;
pub use bitcoin::Txid as TxId;

/// Extracts the destination address of a tx output under the configured
/// network parameters. Non-standard scripts have no address form.
pub fn address_from_script(script: &bitcoin::Script) -> Option<Address> {
    Address::from_script(script, NETWORK)
}

#[derive(Debug, Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq)]
pub struct MilliSats(pub i64);

#[derive(Debug, Clone, Copy, Default, PartialOrd, Ord, PartialEq, Eq)]
pub struct Sats(pub i64);

impl MilliSats {
    pub fn sats_floor(&self) -> Sats {
        Sats(self.0 / 1000)
    }
}

impl Sats {
    pub fn msats(self) -> MilliSats {
        MilliSats(self.0 * 1000)
    }
}

impl Add for MilliSats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for MilliSats {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for MilliSats {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl SubAssign for MilliSats {
    fn sub_assign(&mut self, other: Self) {
        *self = *self - other;
    }
}

impl Add for Sats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Sats {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Sats {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl SubAssign for Sats {
    fn sub_assign(&mut self, other: Self) {
        *self = *self - other;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::blockdata::opcodes;
    use bitcoin::blockdata::script::Builder;
    use std::str::FromStr;

    #[test]
    fn sats_round_trip_through_msats() {
        assert_eq!(Sats(21).msats(), MilliSats(21_000));
        assert_eq!(MilliSats(21_999).sats_floor(), Sats(21));
    }

    #[test]
    fn extracts_address_from_standard_script() {
        let key = bitcoin::PublicKey::from_str(
            "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798",
        )
        .unwrap();
        let address = Address::p2pkh(&key, NETWORK);
        let extracted = address_from_script(&address.script_pubkey()).unwrap();
        assert_eq!(extracted, address);
    }

    #[test]
    fn non_standard_script_has_no_address() {
        let script = Builder::new()
            .push_opcode(opcodes::all::OP_RETURN)
            .push_slice(b"data")
            .into_script();
        assert_eq!(address_from_script(&script), None);
    }
}

//! CIS-2 token event codec.
//!
//! Decodes the binary event layout that CIS-2 contracts emit in their logs:
//! a leading discriminant byte, then the variant's fields. Most contract logs
//! are not CIS-2 events at all, so an unrecognized discriminant (or an empty
//! buffer) is the expected [`DecodeError::NotTokenEvent`] outcome and distinct
//! from a structurally broken buffer. Decoding is a pure function of the
//! bytes; no state is kept between calls.

use num_bigint::BigUint;
use thiserror::Error;

use crate::indexer::types::{
    AccountAddress, Address, ContractAddress, OperatorUpdate, TokenEvent, TokenId,
};

/// Wire discriminants of the five CIS-2 token events.
pub const TOKEN_METADATA_TAG: u8 = 251;
pub const UPDATE_OPERATOR_TAG: u8 = 252;
pub const BURN_TAG: u8 = 253;
pub const MINT_TAG: u8 = 254;
pub const TRANSFER_TAG: u8 = 255;

const ACCOUNT_ADDRESS_TAG: u8 = 0;
const CONTRACT_ADDRESS_TAG: u8 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer does not start with a CIS-2 discriminant. Expected and
    /// frequent; callers skip these silently.
    #[error("not a CIS-2 token event")]
    NotTokenEvent,
    /// The discriminant matched but the buffer ended inside a field.
    #[error("event truncated while reading {0}")]
    Truncated(&'static str),
    /// The buffer ended before the amount varint's terminating byte.
    #[error("token amount varint has no terminating byte")]
    UnterminatedAmount,
    #[error("unknown address tag {0}")]
    UnknownAddressTag(u8),
    #[error("unknown operator update {0}")]
    UnknownOperatorUpdate(u8),
    #[error("unknown metadata hash flag {0}")]
    UnknownHashFlag(u8),
    #[error("metadata url is not valid utf-8")]
    InvalidMetadataUrl,
}

impl DecodeError {
    /// True for the expected non-token outcome, false for malformed data.
    pub fn is_not_token_event(&self) -> bool {
        matches!(self, DecodeError::NotTokenEvent)
    }
}

impl TokenEvent {
    /// The wire discriminant that produces this variant.
    pub fn tag(&self) -> u8 {
        match self {
            TokenEvent::Transfer { .. } => TRANSFER_TAG,
            TokenEvent::Mint { .. } => MINT_TAG,
            TokenEvent::Burn { .. } => BURN_TAG,
            TokenEvent::UpdateOperator { .. } => UPDATE_OPERATOR_TAG,
            TokenEvent::TokenMetadata { .. } => TOKEN_METADATA_TAG,
        }
    }
}

/// Decode a raw contract log as a CIS-2 token event.
///
/// Returns [`DecodeError::NotTokenEvent`] if the leading byte is not one of
/// the five discriminants (or the buffer is empty); any other error means the
/// discriminant matched but the remaining bytes violate the field layout.
pub fn decode_token_event(bytes: &[u8]) -> Result<TokenEvent, DecodeError> {
    let Some((&tag, rest)) = bytes.split_first() else {
        return Err(DecodeError::NotTokenEvent);
    };
    let mut cur = Cursor::new(rest);

    let event = match tag {
        TRANSFER_TAG => TokenEvent::Transfer {
            token_id: cur.token_id()?,
            amount: cur.amount()?,
            from: cur.address()?,
            to: cur.address()?,
        },
        MINT_TAG => TokenEvent::Mint {
            token_id: cur.token_id()?,
            amount: cur.amount()?,
            owner: cur.address()?,
        },
        BURN_TAG => TokenEvent::Burn {
            token_id: cur.token_id()?,
            amount: cur.amount()?,
            owner: cur.address()?,
        },
        UPDATE_OPERATOR_TAG => TokenEvent::UpdateOperator {
            update: cur.operator_update()?,
            owner: cur.address()?,
            operator: cur.address()?,
        },
        TOKEN_METADATA_TAG => {
            let token_id = cur.token_id()?;
            let (metadata_url, metadata_hash) = cur.metadata_url()?;
            TokenEvent::TokenMetadata {
                token_id,
                metadata_url,
                metadata_hash,
            }
        }
        _ => return Err(DecodeError::NotTokenEvent),
    };

    Ok(event)
}

/// Encode a token event back into its canonical wire form. Decoding the
/// result reproduces the event exactly.
pub fn encode_token_event(event: &TokenEvent) -> Vec<u8> {
    let mut out = vec![event.tag()];
    match event {
        TokenEvent::Transfer {
            token_id,
            amount,
            from,
            to,
        } => {
            push_token_id(&mut out, token_id);
            push_amount(&mut out, amount);
            push_address(&mut out, from);
            push_address(&mut out, to);
        }
        TokenEvent::Mint {
            token_id,
            amount,
            owner,
        }
        | TokenEvent::Burn {
            token_id,
            amount,
            owner,
        } => {
            push_token_id(&mut out, token_id);
            push_amount(&mut out, amount);
            push_address(&mut out, owner);
        }
        TokenEvent::UpdateOperator {
            update,
            owner,
            operator,
        } => {
            out.push(match update {
                OperatorUpdate::Remove => 0,
                OperatorUpdate::Add => 1,
            });
            push_address(&mut out, owner);
            push_address(&mut out, operator);
        }
        TokenEvent::TokenMetadata {
            token_id,
            metadata_url,
            metadata_hash,
        } => {
            push_token_id(&mut out, token_id);
            let url = metadata_url.as_bytes();
            debug_assert!(url.len() <= u16::MAX as usize);
            out.extend_from_slice(&(url.len() as u16).to_be_bytes());
            out.extend_from_slice(url);
            match metadata_hash {
                Some(hash) => {
                    out.push(1);
                    out.extend_from_slice(hash);
                }
                None => out.push(0),
            }
        }
    }
    out
}

fn push_token_id(out: &mut Vec<u8>, token_id: &TokenId) {
    out.push(token_id.as_bytes().len() as u8);
    out.extend_from_slice(token_id.as_bytes());
}

/// Little-endian base-128 varint: 7 value bits per byte, high bit set on all
/// but the final byte.
fn push_amount(out: &mut Vec<u8>, amount: &BigUint) {
    let mut n = amount.clone();
    loop {
        let low = n.to_bytes_le()[0] & 0x7f;
        n >>= 7u32;
        if n.bits() == 0 {
            out.push(low);
            return;
        }
        out.push(low | 0x80);
    }
}

fn push_address(out: &mut Vec<u8>, address: &Address) {
    match address {
        Address::Account(account) => {
            out.push(ACCOUNT_ADDRESS_TAG);
            out.extend_from_slice(&account.0);
        }
        Address::Contract(contract) => {
            out.push(CONTRACT_ADDRESS_TAG);
            out.extend_from_slice(&contract.index.to_le_bytes());
            out.extend_from_slice(&contract.subindex.to_le_bytes());
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, DecodeError> {
        let (&byte, rest) = self
            .buf
            .split_first()
            .ok_or(DecodeError::Truncated(field))?;
        self.buf = rest;
        Ok(byte)
    }

    fn bytes(&mut self, len: usize, field: &'static str) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < len {
            return Err(DecodeError::Truncated(field));
        }
        let (taken, rest) = self.buf.split_at(len);
        self.buf = rest;
        Ok(taken)
    }

    fn array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N, field)?);
        Ok(out)
    }

    fn token_id(&mut self) -> Result<TokenId, DecodeError> {
        let len = self.u8("token id length")? as usize;
        Ok(TokenId::new(self.bytes(len, "token id")?.to_vec()))
    }

    /// Arbitrary-precision LEB128 amount. No maximum byte count is imposed;
    /// running out of buffer before a byte with the high bit clear is a
    /// malformed event, not a zero.
    fn amount(&mut self) -> Result<BigUint, DecodeError> {
        let mut value = BigUint::default();
        let mut shift = 0usize;
        loop {
            let Ok(byte) = self.u8("token amount") else {
                return Err(DecodeError::UnterminatedAmount);
            };
            value = value | (BigUint::from(byte & 0x7f) << shift);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    fn address(&mut self) -> Result<Address, DecodeError> {
        match self.u8("address tag")? {
            ACCOUNT_ADDRESS_TAG => Ok(Address::Account(AccountAddress(
                self.array::<32>("account address")?,
            ))),
            CONTRACT_ADDRESS_TAG => {
                let index = self.u64_le("contract index")?;
                let subindex = self.u64_le("contract subindex")?;
                Ok(Address::Contract(ContractAddress::new(index, subindex)))
            }
            other => Err(DecodeError::UnknownAddressTag(other)),
        }
    }

    fn u64_le(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array::<8>(field)?))
    }

    fn operator_update(&mut self) -> Result<OperatorUpdate, DecodeError> {
        match self.u8("operator update")? {
            0 => Ok(OperatorUpdate::Remove),
            1 => Ok(OperatorUpdate::Add),
            other => Err(DecodeError::UnknownOperatorUpdate(other)),
        }
    }

    /// Metadata URL: 2-byte big-endian length, the URL bytes, then a flag
    /// byte selecting an optional 32-byte content hash.
    fn metadata_url(&mut self) -> Result<(String, Option<[u8; 32]>), DecodeError> {
        let len = u16::from_be_bytes(self.array::<2>("metadata url length")?) as usize;
        let url = String::from_utf8(self.bytes(len, "metadata url")?.to_vec())
            .map_err(|_| DecodeError::InvalidMetadataUrl)?;
        let hash = match self.u8("metadata hash flag")? {
            0 => None,
            1 => Some(self.array::<32>("metadata hash")?),
            other => return Err(DecodeError::UnknownHashFlag(other)),
        };
        Ok((url, hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account(byte: u8) -> Address {
        Address::Account(AccountAddress([byte; 32]))
    }

    fn contract(index: u64, subindex: u64) -> Address {
        Address::Contract(ContractAddress::new(index, subindex))
    }

    fn roundtrip(event: TokenEvent) {
        let bytes = encode_token_event(&event);
        assert_eq!(bytes[0], event.tag());
        assert_eq!(decode_token_event(&bytes).unwrap(), event);
    }

    #[test]
    fn transfer_roundtrips() {
        roundtrip(TokenEvent::Transfer {
            token_id: TokenId::new(vec![0x00, 0xff]),
            amount: BigUint::from(12_345u64),
            from: account(1),
            to: contract(42, 7),
        });
    }

    #[test]
    fn mint_roundtrips() {
        roundtrip(TokenEvent::Mint {
            token_id: TokenId::new(vec![]),
            amount: BigUint::from(1u8),
            owner: account(9),
        });
    }

    #[test]
    fn burn_roundtrips() {
        roundtrip(TokenEvent::Burn {
            token_id: TokenId::new(vec![0x01]),
            amount: BigUint::parse_bytes(b"340282366920938463463374607431768211455", 10).unwrap(),
            owner: contract(0, 0),
        });
    }

    #[test]
    fn update_operator_roundtrips() {
        roundtrip(TokenEvent::UpdateOperator {
            update: OperatorUpdate::Add,
            owner: account(3),
            operator: contract(8, 0),
        });
        roundtrip(TokenEvent::UpdateOperator {
            update: OperatorUpdate::Remove,
            owner: contract(8, 0),
            operator: account(3),
        });
    }

    #[test]
    fn token_metadata_roundtrips() {
        roundtrip(TokenEvent::TokenMetadata {
            token_id: TokenId::new(vec![0xaa]),
            metadata_url: "https://tokens.example/1.json".to_string(),
            metadata_hash: Some([0x5c; 32]),
        });
        roundtrip(TokenEvent::TokenMetadata {
            token_id: TokenId::new(vec![]),
            metadata_url: String::new(),
            metadata_hash: None,
        });
    }

    #[test]
    fn varint_roundtrips_boundary_amounts() {
        for amount in [
            BigUint::from(0u8),
            BigUint::from(127u8),
            BigUint::from(128u8),
            BigUint::from(16_384u32),
            BigUint::parse_bytes(b"123456789012345678901234567890123456789", 10).unwrap(),
        ] {
            let mut buf = Vec::new();
            push_amount(&mut buf, &amount);
            let decoded = Cursor::new(&buf).amount().unwrap();
            assert_eq!(decoded, amount);
        }
    }

    #[test]
    fn varint_encoding_uses_minimal_bytes() {
        let mut buf = Vec::new();
        push_amount(&mut buf, &BigUint::from(0u8));
        assert_eq!(buf, vec![0x00]);

        buf.clear();
        push_amount(&mut buf, &BigUint::from(127u8));
        assert_eq!(buf, vec![0x7f]);

        buf.clear();
        push_amount(&mut buf, &BigUint::from(128u8));
        assert_eq!(buf, vec![0x80, 0x01]);

        buf.clear();
        push_amount(&mut buf, &BigUint::from(16_384u32));
        assert_eq!(buf, vec![0x80, 0x80, 0x01]);
    }

    #[test]
    fn empty_buffer_is_not_a_token_event() {
        assert_eq!(decode_token_event(&[]), Err(DecodeError::NotTokenEvent));
    }

    #[test]
    fn unknown_discriminant_is_not_a_token_event() {
        for tag in [0u8, 1, 42, 250] {
            assert_eq!(
                decode_token_event(&[tag, 0x00, 0x01]),
                Err(DecodeError::NotTokenEvent)
            );
        }
    }

    #[test]
    fn truncated_burn_amount_is_malformed() {
        // Burn tag, empty token id, then a varint whose continuation bit
        // promises more bytes than the buffer holds.
        let bytes = [BURN_TAG, 0x00, 0x80];
        assert_eq!(
            decode_token_event(&bytes),
            Err(DecodeError::UnterminatedAmount)
        );
    }

    #[test]
    fn truncated_token_id_is_malformed() {
        let bytes = [MINT_TAG, 0x05, 0x01];
        assert_eq!(
            decode_token_event(&bytes),
            Err(DecodeError::Truncated("token id"))
        );
    }

    #[test]
    fn truncated_account_address_is_malformed() {
        let mut bytes = vec![MINT_TAG, 0x00, 0x01, ACCOUNT_ADDRESS_TAG];
        bytes.extend_from_slice(&[0u8; 16]);
        assert_eq!(
            decode_token_event(&bytes),
            Err(DecodeError::Truncated("account address"))
        );
    }

    #[test]
    fn unknown_address_tag_is_malformed() {
        let bytes = [MINT_TAG, 0x00, 0x01, 0x02];
        assert_eq!(
            decode_token_event(&bytes),
            Err(DecodeError::UnknownAddressTag(2))
        );
    }

    #[test]
    fn truncated_metadata_hash_is_malformed() {
        let mut bytes = vec![TOKEN_METADATA_TAG, 0x00, 0x00, 0x03];
        bytes.extend_from_slice(b"a/b");
        bytes.push(1);
        bytes.extend_from_slice(&[0u8; 8]);
        assert_eq!(
            decode_token_event(&bytes),
            Err(DecodeError::Truncated("metadata hash"))
        );
    }

    #[test]
    fn metadata_url_length_is_big_endian() {
        let mut bytes = vec![TOKEN_METADATA_TAG, 0x00];
        bytes.extend_from_slice(&[0x00, 0x04]);
        bytes.extend_from_slice(b"http");
        bytes.push(0);
        let event = decode_token_event(&bytes).unwrap();
        assert_eq!(
            event,
            TokenEvent::TokenMetadata {
                token_id: TokenId::new(vec![]),
                metadata_url: "http".to_string(),
                metadata_hash: None,
            }
        );
    }

    #[test]
    fn not_token_event_is_distinguishable_from_malformed() {
        assert!(DecodeError::NotTokenEvent.is_not_token_event());
        assert!(!DecodeError::UnterminatedAmount.is_not_token_event());
        assert!(!DecodeError::Truncated("token id").is_not_token_event());
    }
}

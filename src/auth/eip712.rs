//! EIP-712 typed-data verification for order submissions.
//!
//! The digest is `keccak256("\x19\x01" || domainSeparator || structHash)`
//! with the struct hash over the nine order fields in declared order.
//! `alloy-sol-types` computes both sides through the `sol!` macro, so the
//! type string stays in one place.

use alloy_primitives::{Address, Signature, B256, U256};
use alloy_sol_types::{sol, Eip712Domain, SolStruct};

use crate::error::{EngineError, EngineResult};
use crate::fixed::Amount;
use crate::models::{OrderType, Side};

sol! {
    struct Order {
        address trader;
        address token;
        bool isLong;
        uint256 size;
        uint256 leverage;
        uint256 price;
        uint256 deadline;
        uint256 nonce;
        uint8 orderType;
    }
}

const DOMAIN_NAME: &str = "MemePerp";
const DOMAIN_VERSION: &str = "1";

/// A decoded submission before engine-side validation. `signature` is the
/// raw 65-byte r||s||v payload.
#[derive(Debug, Clone)]
pub struct OrderMessage {
    pub trader: Address,
    pub token: Address,
    pub side: Side,
    pub size: Amount,
    pub leverage: u128,
    pub price: Amount,
    pub deadline: u64,
    pub nonce: u64,
    pub order_type: OrderType,
    pub signature: [u8; 65],
}

impl OrderMessage {
    fn to_sol(&self) -> Order {
        Order {
            trader: self.trader,
            token: self.token,
            isLong: self.side.is_long(),
            size: U256::from(self.size),
            leverage: U256::from(self.leverage),
            price: U256::from(self.price),
            deadline: U256::from(self.deadline),
            nonce: U256::from(self.nonce),
            orderType: self.order_type.to_wire(),
        }
    }
}

/// Verifies order signatures against a fixed domain.
#[derive(Debug, Clone)]
pub struct OrderValidator {
    domain: Eip712Domain,
}

impl OrderValidator {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        let domain = Eip712Domain {
            name: Some(DOMAIN_NAME.into()),
            version: Some(DOMAIN_VERSION.into()),
            chain_id: Some(U256::from(chain_id)),
            verifying_contract: Some(verifying_contract),
            salt: None,
        };
        Self { domain }
    }

    /// The EIP-712 signing digest for a message.
    pub fn digest(&self, msg: &OrderMessage) -> B256 {
        msg.to_sol().eip712_signing_hash(&self.domain)
    }

    /// Recover the signer and require it to be the claimed trader.
    pub fn verify(&self, msg: &OrderMessage) -> EngineResult<()> {
        let digest = self.digest(msg);

        let r = U256::from_be_slice(&msg.signature[..32]);
        let s = U256::from_be_slice(&msg.signature[32..64]);
        // Accept both raw y-parity (0/1) and legacy v (27/28).
        let v = msg.signature[64];
        let parity = if v >= 27 { v - 27 } else { v };
        if parity > 1 {
            return Err(EngineError::BadSignature);
        }

        let signature = Signature::from_rs_and_parity(r, s, parity == 1)
            .map_err(|_| EngineError::BadSignature)?;
        let recovered = signature
            .recover_address_from_prehash(&digest)
            .map_err(|_| EngineError::BadSignature)?;

        if recovered != msg.trader {
            return Err(EngineError::BadSignature);
        }
        Ok(())
    }
}

/// Parse a 0x-prefixed 65-byte hex signature from the wire.
pub fn parse_signature_hex(raw: &str) -> EngineResult<[u8; 65]> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    let bytes = hex::decode(stripped).map_err(|_| EngineError::BadSignature)?;
    if bytes.len() != 65 {
        return Err(EngineError::BadSignature);
    }
    let mut out = [0u8; 65];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;

    fn message(trader: Address) -> OrderMessage {
        OrderMessage {
            trader,
            token: Address::repeat_byte(0x22),
            side: Side::Long,
            size: crate::fixed::ONE,
            leverage: 5 * crate::fixed::LEVERAGE_ONE,
            price: 2 * crate::fixed::ONE,
            deadline: 4_000_000_000,
            nonce: 1,
            order_type: OrderType::Limit,
            signature: [0u8; 65],
        }
    }

    fn sign(msg: &mut OrderMessage, signer: &PrivateKeySigner, validator: &OrderValidator) {
        let digest = validator.digest(msg);
        let sig = signer.sign_hash_sync(&digest).unwrap();
        msg.signature.copy_from_slice(&sig.as_bytes());
    }

    #[test]
    fn valid_signature_recovers_trader() {
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let mut msg = message(signer.address());
        sign(&mut msg, &signer, &validator);
        assert!(validator.verify(&msg).is_ok());
    }

    #[test]
    fn wrong_trader_is_rejected() {
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let mut msg = message(Address::repeat_byte(0x99));
        sign(&mut msg, &signer, &validator);
        assert_eq!(validator.verify(&msg), Err(EngineError::BadSignature));
    }

    #[test]
    fn tampered_field_breaks_signature() {
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let mut msg = message(signer.address());
        sign(&mut msg, &signer, &validator);
        msg.size += 1;
        assert_eq!(validator.verify(&msg), Err(EngineError::BadSignature));
    }

    #[test]
    fn digest_is_stable_across_round_trip() {
        // Serialize the fields out and back; the digest must not move.
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let msg = message(signer.address());
        let digest = validator.digest(&msg);

        let copy = OrderMessage {
            size: msg.size.to_string().parse().unwrap(),
            price: msg.price.to_string().parse().unwrap(),
            ..msg.clone()
        };
        assert_eq!(validator.digest(&copy), digest);
    }

    #[test]
    fn legacy_v_values_are_accepted() {
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let mut msg = message(signer.address());
        sign(&mut msg, &signer, &validator);
        // Re-encode v as 27/28 instead of 0/1.
        msg.signature[64] += 27;
        assert!(validator.verify(&msg).is_ok());
    }

    #[test]
    fn different_domain_chain_rejects() {
        let signer = PrivateKeySigner::random();
        let validator = OrderValidator::new(8453, Address::repeat_byte(0x01));
        let other = OrderValidator::new(1, Address::repeat_byte(0x01));
        let mut msg = message(signer.address());
        sign(&mut msg, &signer, &validator);
        assert_eq!(other.verify(&msg), Err(EngineError::BadSignature));
    }

    #[test]
    fn signature_hex_parsing() {
        let hex65 = format!("0x{}", "11".repeat(65));
        assert!(parse_signature_hex(&hex65).is_ok());
        assert!(parse_signature_hex("0x1234").is_err());
        assert!(parse_signature_hex("zz").is_err());
    }
}

/// Script utilities: classify scriptPubKeys and render Flux base58check
/// addresses. Used when the daemon omits the address (verbosity-1 blocks,
/// non-standard vouts) and to derive P2SH / P2PKH addresses from keys the
/// node-tx parser recovers.
///
/// Flux uses Zcash-style two-byte version prefixes: t1 (P2PKH) and
/// t3 (P2SH) transparent addresses.

use ripemd160::{Digest as RipemdDigest, Ripemd160};
use sha2::{Digest, Sha256};

/// P2PKH version prefix ("t1...").
pub const P2PKH_PREFIX: [u8; 2] = [0x1C, 0xB8];
/// P2SH version prefix ("t3...").
pub const P2SH_PREFIX: [u8; 2] = [0x1C, 0xBD];

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xA9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xAC;
const OP_RETURN: u8 = 0x6A;

/// Script classification carrying the rendered address where one exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptClass {
    P2PKH(String),
    P2SH(String),
    P2PK(String),
    OpReturn,
    Nonstandard,
}

impl ScriptClass {
    pub fn address(&self) -> Option<&str> {
        match self {
            ScriptClass::P2PKH(a) | ScriptClass::P2SH(a) | ScriptClass::P2PK(a) => Some(a),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ScriptClass::P2PKH(_) => "pubkeyhash",
            ScriptClass::P2SH(_) => "scripthash",
            ScriptClass::P2PK(_) => "pubkey",
            ScriptClass::OpReturn => "nulldata",
            ScriptClass::Nonstandard => "nonstandard",
        }
    }
}

fn sha256(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

fn sha256d(data: &[u8]) -> Vec<u8> {
    sha256(&sha256(data))
}

/// hash160 = ripemd160(sha256(data))
pub fn hash160(data: &[u8]) -> Vec<u8> {
    Ripemd160::digest(&Sha256::digest(data)).to_vec()
}

/// Base58check-encode a 20-byte hash under a two-byte version prefix.
pub fn encode_address(hash: &[u8], prefix: [u8; 2]) -> String {
    let mut payload = prefix.to_vec();
    payload.extend_from_slice(hash);
    let checksum = sha256d(&payload);
    payload.extend_from_slice(&checksum[0..4]);
    bs58::encode(payload).into_string()
}

/// P2PKH address for a (compressed or uncompressed) public key.
pub fn pubkey_to_address(pubkey: &[u8]) -> String {
    encode_address(&hash160(pubkey), P2PKH_PREFIX)
}

/// P2SH address for a redeem script.
pub fn redeem_script_to_address(redeem_script: &[u8]) -> String {
    encode_address(&hash160(redeem_script), P2SH_PREFIX)
}

/// Classify a raw scriptPubKey.
pub fn classify_script(script: &[u8]) -> ScriptClass {
    match script {
        [] => ScriptClass::Nonstandard,
        [OP_RETURN, ..] => ScriptClass::OpReturn,
        [OP_DUP, OP_HASH160, 0x14, .., OP_EQUALVERIFY, OP_CHECKSIG] if script.len() == 25 => {
            ScriptClass::P2PKH(encode_address(&script[3..23], P2PKH_PREFIX))
        }
        [OP_HASH160, 0x14, .., OP_EQUAL] if script.len() == 23 => {
            ScriptClass::P2SH(encode_address(&script[2..22], P2SH_PREFIX))
        }
        // Bare pubkey: push(33|65) <key> OP_CHECKSIG
        [0x21, .., OP_CHECKSIG] if script.len() == 35 => {
            ScriptClass::P2PK(pubkey_to_address(&script[1..34]))
        }
        [0x41, .., OP_CHECKSIG] if script.len() == 67 => {
            ScriptClass::P2PK(pubkey_to_address(&script[1..66]))
        }
        _ => ScriptClass::Nonstandard,
    }
}

/// Classify from the hex form the RPC hands us.
pub fn classify_script_hex(hex_script: &str) -> ScriptClass {
    match hex::decode(hex_script) {
        Ok(bytes) => classify_script(&bytes),
        Err(_) => ScriptClass::Nonstandard,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2pkh_script_classifies() {
        let mut script = vec![OP_DUP, OP_HASH160, 0x14];
        script.extend_from_slice(&[0x11u8; 20]);
        script.push(OP_EQUALVERIFY);
        script.push(OP_CHECKSIG);

        match classify_script(&script) {
            ScriptClass::P2PKH(addr) => assert!(addr.starts_with("t1")),
            other => panic!("expected P2PKH, got {:?}", other),
        }
    }

    #[test]
    fn p2sh_script_classifies() {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[0x22u8; 20]);
        script.push(OP_EQUAL);

        match classify_script(&script) {
            ScriptClass::P2SH(addr) => assert!(addr.starts_with("t3")),
            other => panic!("expected P2SH, got {:?}", other),
        }
    }

    #[test]
    fn p2pk_script_classifies() {
        let mut script = vec![0x21];
        script.extend_from_slice(&[0x02u8; 33]);
        script.push(OP_CHECKSIG);

        assert!(matches!(classify_script(&script), ScriptClass::P2PK(_)));
    }

    #[test]
    fn op_return_and_garbage() {
        assert_eq!(classify_script(&[OP_RETURN, 0x01, 0xFF]), ScriptClass::OpReturn);
        assert_eq!(classify_script(&[0xC1, 0x00]), ScriptClass::Nonstandard);
        assert_eq!(classify_script(&[]), ScriptClass::Nonstandard);
        assert_eq!(classify_script_hex("zz"), ScriptClass::Nonstandard);
    }

    #[test]
    fn address_roundtrip_is_stable() {
        let a = encode_address(&[0x33u8; 20], P2PKH_PREFIX);
        let b = encode_address(&[0x33u8; 20], P2PKH_PREFIX);
        assert_eq!(a, b);
        assert_ne!(a, encode_address(&[0x33u8; 20], P2SH_PREFIX));
    }

    #[test]
    fn redeem_script_address_is_p2sh() {
        let addr = redeem_script_to_address(&[0x51, 0x21, 0x03]);
        assert!(addr.starts_with("t3"));
    }
}

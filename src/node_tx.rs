/// FluxNode transaction parser.
///
/// Node registration (start) and confirmation messages do not follow the
/// standard input/output model; they are recognized by (version, nType)
/// and decoded directly from raw transaction hex:
///
/// - version 3: legacy node transaction, payload kept opaque
/// - version 5/6, nType 2: node-start
/// - version 5/6, nType 4: node-confirm
/// - anything else: not a node transaction
///
/// Start messages come in two on-wire dialects selected by internalVersion
/// bit flags (version 5 omits the field and is decoded as the normal
/// dialect): P2SH multisig (bit 0x02) and normal single-key (bit 0x01).
/// Bit 0x0100 appends an optional delegate-key block after the signature.
///
/// Truncated input fails the whole parse with the field name and offset;
/// callers then treat the transaction as non-node.

use byteorder::{LittleEndian, ReadBytesExt};
use std::fmt;
use std::io::{Cursor, Read};

use crate::types::OutPoint;

pub const NODE_TX_TYPE_START: u8 = 2;
pub const NODE_TX_TYPE_CONFIRM: u8 = 4;

const DIALECT_NORMAL_BIT: u32 = 0x01;
const DIALECT_P2SH_BIT: u32 = 0x02;
const DELEGATE_BIT: u32 = 0x0100;

/// Parse failure; `field` names the wire field being read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTxParseError {
    InvalidHex,
    Truncated { field: &'static str, offset: usize },
    Oversize { field: &'static str, len: u64 },
}

impl fmt::Display for NodeTxParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeTxParseError::InvalidHex => write!(f, "transaction hex is not valid hex"),
            NodeTxParseError::Truncated { field, offset } => {
                write!(f, "truncated at field {} (offset {})", field, offset)
            }
            NodeTxParseError::Oversize { field, len } => {
                write!(f, "length {} for field {} exceeds 32-bit clamp", len, field)
            }
        }
    }
}

impl std::error::Error for NodeTxParseError {}

/// Normal dialect carries the collateral key and the node key; P2SH
/// carries the node key plus the multisig redeem script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartDialect {
    Normal {
        collateral_pubkey: Vec<u8>,
        pubkey: Vec<u8>,
    },
    P2sh {
        pubkey: Vec<u8>,
        redeem_script: Vec<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTxStart {
    pub version: i32,
    pub internal_version: Option<u32>,
    pub collateral: OutPoint,
    pub dialect: StartDialect,
    pub sig_time: u32,
    pub signature: Vec<u8>,
    pub delegate_keys: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeTxConfirm {
    pub version: i32,
    pub collateral: OutPoint,
    pub sig_time: u32,
    pub benchmark_tier: i8,
    pub benchmark_sig_time: u32,
    pub update_type: i8,
    pub ip: String,
    pub signature: Vec<u8>,
    pub benchmark_signature: Vec<u8>,
}

/// Tagged parser output; callers dispatch on the variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeTx {
    NotNodeTx,
    LegacyV3 { payload: Vec<u8> },
    Start(NodeTxStart),
    Confirm(NodeTxConfirm),
}

struct Reader<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            cursor: Cursor::new(data),
        }
    }

    fn offset(&self) -> usize {
        self.cursor.position() as usize
    }

    fn remaining(&self) -> Vec<u8> {
        let pos = self.offset();
        self.cursor.get_ref()[pos..].to_vec()
    }

    fn u8(&mut self, field: &'static str) -> Result<u8, NodeTxParseError> {
        let offset = self.offset();
        self.cursor
            .read_u8()
            .map_err(|_| NodeTxParseError::Truncated { field, offset })
    }

    fn i8(&mut self, field: &'static str) -> Result<i8, NodeTxParseError> {
        let offset = self.offset();
        self.cursor
            .read_i8()
            .map_err(|_| NodeTxParseError::Truncated { field, offset })
    }

    fn u32_le(&mut self, field: &'static str) -> Result<u32, NodeTxParseError> {
        let offset = self.offset();
        self.cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| NodeTxParseError::Truncated { field, offset })
    }

    fn bytes(&mut self, n: usize, field: &'static str) -> Result<Vec<u8>, NodeTxParseError> {
        let offset = self.offset();
        let mut buf = vec![0u8; n];
        self.cursor
            .read_exact(&mut buf)
            .map_err(|_| NodeTxParseError::Truncated { field, offset })?;
        Ok(buf)
    }

    /// Compact-size integer: <0xFD inline, 0xFD u16, 0xFE u32, 0xFF u64.
    /// Clamped to 32 bits; larger values fail the parse.
    fn varint(&mut self, field: &'static str) -> Result<u32, NodeTxParseError> {
        let first = self.u8(field)?;
        match first {
            0xFF => {
                let offset = self.offset();
                let v = self
                    .cursor
                    .read_u64::<LittleEndian>()
                    .map_err(|_| NodeTxParseError::Truncated { field, offset })?;
                u32::try_from(v).map_err(|_| NodeTxParseError::Oversize { field, len: v })
            }
            0xFE => self.u32_le(field),
            0xFD => {
                let offset = self.offset();
                let v = self
                    .cursor
                    .read_u16::<LittleEndian>()
                    .map_err(|_| NodeTxParseError::Truncated { field, offset })?;
                Ok(v as u32)
            }
            n => Ok(n as u32),
        }
    }

    fn varbytes(&mut self, field: &'static str) -> Result<Vec<u8>, NodeTxParseError> {
        let len = self.varint(field)? as usize;
        self.bytes(len, field)
    }

    /// Outpoint on the wire: 32-byte txid in reversed order, u32 LE index.
    fn outpoint(&mut self, field: &'static str) -> Result<OutPoint, NodeTxParseError> {
        let mut txid = self.bytes(32, field)?;
        txid.reverse();
        let vout = self.u32_le(field)?;
        Ok(OutPoint::new(hex::encode(txid), vout))
    }
}

/// Decode raw transaction hex into a tagged node-transaction.
pub fn parse_node_tx(raw_hex: &str) -> Result<NodeTx, NodeTxParseError> {
    let data = hex::decode(raw_hex.trim()).map_err(|_| NodeTxParseError::InvalidHex)?;
    parse_node_tx_bytes(&data)
}

pub fn parse_node_tx_bytes(data: &[u8]) -> Result<NodeTx, NodeTxParseError> {
    let mut r = Reader::new(data);

    let version = r.u32_le("version")? as i32;
    match version {
        3 => Ok(NodeTx::LegacyV3 {
            payload: r.remaining(),
        }),
        5 | 6 => {
            let n_type = r.u8("nType")?;
            match n_type {
                NODE_TX_TYPE_START => parse_start(&mut r, version).map(NodeTx::Start),
                NODE_TX_TYPE_CONFIRM => parse_confirm(&mut r, version).map(NodeTx::Confirm),
                _ => Ok(NodeTx::NotNodeTx),
            }
        }
        _ => Ok(NodeTx::NotNodeTx),
    }
}

fn parse_start(r: &mut Reader<'_>, version: i32) -> Result<NodeTxStart, NodeTxParseError> {
    let internal_version = if version >= 6 {
        Some(r.u32_le("internalVersion")?)
    } else {
        None
    };

    let collateral = r.outpoint("collateralOutpoint")?;
    let flags = internal_version.unwrap_or(0);

    let dialect = if flags & DIALECT_P2SH_BIT != 0 {
        StartDialect::P2sh {
            pubkey: r.varbytes("pubkey")?,
            redeem_script: r.varbytes("redeemScript")?,
        }
    } else {
        // Normal dialect, also the fallback for unknown flag patterns.
        StartDialect::Normal {
            collateral_pubkey: r.varbytes("collateralPubkey")?,
            pubkey: r.varbytes("pubkey")?,
        }
    };

    let sig_time = r.u32_le("sigTime")?;
    let signature = r.varbytes("signature")?;

    let mut delegate_keys = Vec::new();
    if flags & DELEGATE_BIT != 0 {
        let using = r.u8("delegateUsingFlag")?;
        if using != 0 {
            let count = r.varint("delegateCount")?;
            for _ in 0..count {
                delegate_keys.push(r.varbytes("delegateKey")?);
            }
        }
    }

    Ok(NodeTxStart {
        version,
        internal_version,
        collateral,
        dialect,
        sig_time,
        signature,
        delegate_keys,
    })
}

fn parse_confirm(r: &mut Reader<'_>, version: i32) -> Result<NodeTxConfirm, NodeTxParseError> {
    let collateral = r.outpoint("collateralOutpoint")?;
    let sig_time = r.u32_le("sigTime")?;
    let benchmark_tier = r.i8("benchmarkTier")?;
    let benchmark_sig_time = r.u32_le("benchmarkSigTime")?;
    let update_type = r.i8("updateType")?;
    let ip_bytes = r.varbytes("ip")?;
    let ip = String::from_utf8_lossy(&ip_bytes).into_owned();
    let signature = r.varbytes("sig")?;
    let benchmark_signature = r.varbytes("benchmarkSig")?;

    Ok(NodeTxConfirm {
        version,
        collateral,
        sig_time,
        benchmark_tier,
        benchmark_sig_time,
        update_type,
        ip,
        signature,
        benchmark_signature,
    })
}

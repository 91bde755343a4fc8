//! # Script Builder
//!
//! The three tapscript leaves of the swap contract, the legacy P2WSH HTLC witness
//! script, and parsers that recover the typed parameters from each shape.
//!
//! Operand order inside every leaf is part of the wire contract: both counterparties
//! compile these scripts independently and must land on the same contract address.

use bitcoin::key::XOnlyPublicKey;
use bitcoin::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGVERIFY, OP_CLTV, OP_CSV, OP_DROP, OP_ELSE, OP_ENDIF, OP_EQUAL,
    OP_EQUALVERIFY, OP_IF, OP_SHA256,
};
use bitcoin::opcodes::{Class, ClassifyContext};
use bitcoin::script::{read_scriptint, Builder, Instruction};
use bitcoin::{PublicKey, Script, ScriptBuf, Sequence};
use serde::{Deserialize, Serialize};

use crate::config::protocol::{
    CSV_DISABLE_FLAG, CSV_MAX_UNITS, CSV_TYPE_FLAG, CSV_UNIT_SECS, CSV_VALUE_MASK,
    MIN_DELAY_SECS,
};
use crate::error::{SwapError, SwapResult};

/// BIP68 time-based relative delay, quantized to 512-second units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvDelay {
    units: u16,
}

impl CsvDelay {
    /// Round `seconds` up to whole 512-second units.
    ///
    /// Rejects delays under the 900-second minimum and delays that do not fit in
    /// 16 bits of units.
    pub fn from_seconds(seconds: u64) -> SwapResult<Self> {
        if seconds < MIN_DELAY_SECS {
            return Err(SwapError::TimelockTooShort {
                minimum: MIN_DELAY_SECS,
                actual: seconds,
            });
        }
        let units = seconds.div_ceil(CSV_UNIT_SECS);
        if units > u64::from(CSV_MAX_UNITS) {
            return Err(SwapError::InvalidTimelock {
                message: format!(
                    "{} seconds needs {} CSV units, maximum is {}",
                    seconds, units, CSV_MAX_UNITS
                ),
            });
        }
        Ok(Self {
            units: units as u16,
        })
    }

    /// Decode a consensus sequence value carrying a time-based relative lock.
    pub fn from_sequence(sequence: u32) -> SwapResult<Self> {
        if sequence & CSV_DISABLE_FLAG != 0 {
            return Err(SwapError::InvalidTimelock {
                message: format!("sequence {:#010x} has the disable flag set", sequence),
            });
        }
        if sequence & CSV_TYPE_FLAG == 0 {
            return Err(SwapError::InvalidTimelock {
                message: format!("sequence {:#010x} is block-based, expected time-based", sequence),
            });
        }
        if sequence & !(CSV_TYPE_FLAG | CSV_VALUE_MASK) != 0 {
            return Err(SwapError::InvalidTimelock {
                message: format!("sequence {:#010x} has unexpected bits set", sequence),
            });
        }

        let units = (sequence & CSV_VALUE_MASK) as u16;
        let seconds = u64::from(units) * CSV_UNIT_SECS;
        if seconds < MIN_DELAY_SECS {
            return Err(SwapError::TimelockTooShort {
                minimum: MIN_DELAY_SECS,
                actual: seconds,
            });
        }
        Ok(Self { units })
    }

    pub fn units(&self) -> u16 {
        self.units
    }

    /// Effective delay in seconds (units * 512)
    pub fn seconds(&self) -> u64 {
        u64::from(self.units) * CSV_UNIT_SECS
    }

    pub fn to_consensus_u32(&self) -> u32 {
        CSV_TYPE_FLAG | u32::from(self.units)
    }

    /// Sequence an input spending the refund leaf must carry
    pub fn to_sequence(&self) -> Sequence {
        Sequence::from_consensus(self.to_consensus_u32())
    }
}

/// Parameters recovered from a multisig leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultisigLeaf {
    pub sender: XOnlyPublicKey,
    pub receiver: XOnlyPublicKey,
}

/// Parameters recovered from a hashlock leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashlockLeaf {
    pub hashlock: [u8; 32],
    pub receiver: XOnlyPublicKey,
}

/// Parameters recovered from a refund leaf
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefundLeaf {
    pub delay: CsvDelay,
    pub sender: XOnlyPublicKey,
}

/// Parameters recovered from the legacy P2WSH HTLC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyHtlc {
    pub hashlock: [u8; 32],
    pub receiver: PublicKey,
    pub refund: PublicKey,
    /// Absolute block height
    pub cltv_height: u32,
}

/// `<xSender> OP_CHECKSIGVERIFY <xReceiver> OP_CHECKSIG`
pub fn multisig_leaf(sender: &XOnlyPublicKey, receiver: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_x_only_key(sender)
        .push_opcode(OP_CHECKSIGVERIFY)
        .push_x_only_key(receiver)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `OP_SHA256 <hashlock> OP_EQUALVERIFY <xReceiver> OP_CHECKSIG`
pub fn hashlock_leaf(hashlock: &[u8; 32], receiver: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hashlock)
        .push_opcode(OP_EQUALVERIFY)
        .push_x_only_key(receiver)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `<csvSequence> OP_CHECKSEQUENCEVERIFY OP_DROP <xSender> OP_CHECKSIG`
pub fn refund_leaf(delay: CsvDelay, sender: &XOnlyPublicKey) -> ScriptBuf {
    Builder::new()
        .push_int(i64::from(delay.to_consensus_u32()))
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .push_x_only_key(sender)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// `OP_SHA256 <h> OP_EQUAL OP_IF <receiver> OP_ELSE <cltv> OP_CLTV OP_DROP <refund> OP_ENDIF OP_CHECKSIG`
pub fn legacy_htlc_script(
    hashlock: &[u8; 32],
    receiver: &PublicKey,
    refund: &PublicKey,
    cltv_height: u32,
) -> ScriptBuf {
    Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hashlock)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_key(receiver)
        .push_opcode(OP_ELSE)
        .push_int(i64::from(cltv_height))
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .push_key(refund)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// Parse a 32-byte x-only key, rejecting any other length
pub fn x_only_from_slice(field: &str, bytes: &[u8]) -> SwapResult<XOnlyPublicKey> {
    if bytes.len() != 32 {
        return Err(SwapError::length(field, 32, bytes.len()));
    }
    XOnlyPublicKey::from_slice(bytes).map_err(|e| SwapError::input(field, e.to_string()))
}

pub fn parse_multisig_leaf(script: &Script) -> SwapResult<MultisigLeaf> {
    let items = tokens("multisig", script, 4)?;
    expect_op("multisig", &items[1], OP_CHECKSIGVERIFY)?;
    expect_op("multisig", &items[3], OP_CHECKSIG)?;
    Ok(MultisigLeaf {
        sender: x_only_item("multisig", &items[0])?,
        receiver: x_only_item("multisig", &items[2])?,
    })
}

pub fn parse_hashlock_leaf(script: &Script) -> SwapResult<HashlockLeaf> {
    let items = tokens("hashlock", script, 5)?;
    expect_op("hashlock", &items[0], OP_SHA256)?;
    expect_op("hashlock", &items[2], OP_EQUALVERIFY)?;
    expect_op("hashlock", &items[4], OP_CHECKSIG)?;
    Ok(HashlockLeaf {
        hashlock: hash_item("hashlock", &items[1])?,
        receiver: x_only_item("hashlock", &items[3])?,
    })
}

pub fn parse_refund_leaf(script: &Script) -> SwapResult<RefundLeaf> {
    let items = tokens("refund", script, 5)?;
    expect_op("refund", &items[1], OP_CSV)?;
    expect_op("refund", &items[2], OP_DROP)?;
    expect_op("refund", &items[4], OP_CHECKSIG)?;

    let sequence = number_item("refund", &items[0])?;
    let sequence = u32::try_from(sequence)
        .map_err(|_| SwapError::leaf("refund", format!("CSV operand {} out of range", sequence)))?;
    Ok(RefundLeaf {
        delay: CsvDelay::from_sequence(sequence)?,
        sender: x_only_item("refund", &items[3])?,
    })
}

pub fn parse_legacy_htlc(script: &Script) -> SwapResult<LegacyHtlc> {
    let items = tokens("legacy htlc", script, 12)?;
    let shape = [
        (0, OP_SHA256),
        (2, OP_EQUAL),
        (3, OP_IF),
        (5, OP_ELSE),
        (7, OP_CLTV),
        (8, OP_DROP),
        (10, OP_ENDIF),
        (11, OP_CHECKSIG),
    ];
    for (index, op) in shape {
        expect_op("legacy htlc", &items[index], op)?;
    }

    let height = number_item("legacy htlc", &items[6])?;
    let cltv_height = u32::try_from(height)
        .map_err(|_| SwapError::leaf("legacy htlc", format!("CLTV operand {} out of range", height)))?;

    Ok(LegacyHtlc {
        hashlock: hash_item("legacy htlc", &items[1])?,
        receiver: key_item("legacy htlc", &items[4])?,
        refund: key_item("legacy htlc", &items[9])?,
        cltv_height,
    })
}

enum Token<'a> {
    Op(bitcoin::Opcode),
    Push(&'a [u8]),
}

fn tokens<'a>(leaf: &str, script: &'a Script, expected: usize) -> SwapResult<Vec<Token<'a>>> {
    let mut items = Vec::with_capacity(expected);
    for instruction in script.instructions() {
        let instruction = instruction
            .map_err(|e| SwapError::leaf(leaf, format!("undecodable script: {}", e)))?;
        items.push(match instruction {
            Instruction::Op(op) => Token::Op(op),
            Instruction::PushBytes(bytes) => Token::Push(bytes.as_bytes()),
        });
    }
    if items.len() != expected {
        return Err(SwapError::leaf(
            leaf,
            format!("expected {} elements, found {}", expected, items.len()),
        ));
    }
    Ok(items)
}

fn expect_op(leaf: &str, token: &Token<'_>, op: bitcoin::Opcode) -> SwapResult<()> {
    match token {
        Token::Op(found) if *found == op => Ok(()),
        Token::Op(found) => Err(SwapError::leaf(leaf, format!("expected {}, found {}", op, found))),
        Token::Push(_) => Err(SwapError::leaf(leaf, format!("expected {}, found a push", op))),
    }
}

fn push_item<'a>(leaf: &str, token: &Token<'a>) -> SwapResult<&'a [u8]> {
    match token {
        Token::Push(bytes) => Ok(bytes),
        Token::Op(op) => Err(SwapError::leaf(leaf, format!("expected a push, found {}", op))),
    }
}

fn x_only_item(leaf: &str, token: &Token<'_>) -> SwapResult<XOnlyPublicKey> {
    let bytes = push_item(leaf, token)?;
    if bytes.len() != 32 {
        return Err(SwapError::leaf(
            leaf,
            format!("expected a 32-byte x-only key, found {} bytes", bytes.len()),
        ));
    }
    XOnlyPublicKey::from_slice(bytes).map_err(|e| SwapError::leaf(leaf, e.to_string()))
}

fn key_item(leaf: &str, token: &Token<'_>) -> SwapResult<PublicKey> {
    let bytes = push_item(leaf, token)?;
    PublicKey::from_slice(bytes).map_err(|e| SwapError::leaf(leaf, e.to_string()))
}

fn hash_item(leaf: &str, token: &Token<'_>) -> SwapResult<[u8; 32]> {
    let bytes = push_item(leaf, token)?;
    bytes.try_into().map_err(|_| {
        SwapError::leaf(leaf, format!("expected a 32-byte hashlock, found {} bytes", bytes.len()))
    })
}

fn number_item(leaf: &str, token: &Token<'_>) -> SwapResult<i64> {
    match token {
        // minimal encoding, at most 4 bytes
        Token::Push(bytes) => {
            read_scriptint(bytes).map_err(|e| SwapError::leaf(leaf, e.to_string()))
        }
        Token::Op(op) => match op.classify(ClassifyContext::Legacy) {
            Class::PushNum(n) => Ok(i64::from(n)),
            _ => Err(SwapError::leaf(leaf, format!("expected a number, found {}", op))),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};

    fn xonly(byte: u8) -> XOnlyPublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk).x_only_public_key().0
    }

    #[test]
    fn test_csv_delay_rounds_up() {
        let delay = CsvDelay::from_seconds(1200).unwrap();
        assert_eq!(delay.units(), 3);
        assert_eq!(delay.seconds(), 1536);
        assert_eq!(delay.to_consensus_u32(), 0x0040_0003);

        assert_eq!(CsvDelay::from_seconds(900).unwrap().units(), 2);
        assert_eq!(CsvDelay::from_seconds(1024).unwrap().units(), 2);
        assert_eq!(CsvDelay::from_seconds(1025).unwrap().units(), 3);
    }

    #[test]
    fn test_csv_delay_limits() {
        assert!(matches!(
            CsvDelay::from_seconds(899),
            Err(SwapError::TimelockTooShort { minimum: 900, actual: 899 })
        ));
        assert_eq!(
            CsvDelay::from_seconds(0xffff * 512).unwrap().units(),
            0xffff
        );
        assert!(matches!(
            CsvDelay::from_seconds(0xffff * 512 + 1),
            Err(SwapError::InvalidTimelock { .. })
        ));
    }

    #[test]
    fn test_csv_delay_from_sequence() {
        assert_eq!(CsvDelay::from_sequence(0x0040_0003).unwrap().units(), 3);
        // block-based
        assert!(CsvDelay::from_sequence(0x0000_0003).is_err());
        // disabled
        assert!(CsvDelay::from_sequence(0x8040_0003).is_err());
        // one unit is below the floor
        assert!(matches!(
            CsvDelay::from_sequence(0x0040_0001),
            Err(SwapError::TimelockTooShort { .. })
        ));
    }

    #[test]
    fn test_multisig_leaf_bytes() {
        let (s, r) = (xonly(1), xonly(2));
        let script = multisig_leaf(&s, &r);
        let bytes = script.as_bytes();

        assert_eq!(bytes.len(), 68);
        assert_eq!(bytes[0], 0x20);
        assert_eq!(&bytes[1..33], &s.serialize());
        assert_eq!(bytes[33], 0xad);
        assert_eq!(bytes[34], 0x20);
        assert_eq!(&bytes[35..67], &r.serialize());
        assert_eq!(bytes[67], 0xac);

        let parsed = parse_multisig_leaf(&script).unwrap();
        assert_eq!(parsed, MultisigLeaf { sender: s, receiver: r });
    }

    #[test]
    fn test_hashlock_leaf_bytes() {
        let r = xonly(2);
        let hashlock = [0x42; 32];
        let script = hashlock_leaf(&hashlock, &r);
        let bytes = script.as_bytes();

        assert_eq!(bytes.len(), 69);
        assert_eq!(bytes[0], 0xa8);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[2..34], &hashlock);
        assert_eq!(bytes[34], 0x88);
        assert_eq!(bytes[35], 0x20);
        assert_eq!(bytes[68], 0xac);

        let parsed = parse_hashlock_leaf(&script).unwrap();
        assert_eq!(parsed.hashlock, hashlock);
        assert_eq!(parsed.receiver, r);
    }

    #[test]
    fn test_refund_leaf_bytes() {
        let s = xonly(1);
        let delay = CsvDelay::from_seconds(1200).unwrap();
        let script = refund_leaf(delay, &s);
        let bytes = script.as_bytes();

        // 0x00400003 as a minimal little-endian script number
        assert_eq!(bytes.len(), 40);
        assert_eq!(&bytes[..4], &[0x03, 0x03, 0x00, 0x40]);
        assert_eq!(bytes[4], 0xb2);
        assert_eq!(bytes[5], 0x75);
        assert_eq!(bytes[6], 0x20);
        assert_eq!(&bytes[7..39], &s.serialize());
        assert_eq!(bytes[39], 0xac);

        let parsed = parse_refund_leaf(&script).unwrap();
        assert_eq!(parsed.delay, delay);
        assert_eq!(parsed.sender, s);
    }

    #[test]
    fn test_parsers_reject_other_shapes() {
        let (s, r) = (xonly(1), xonly(2));
        let multisig = multisig_leaf(&s, &r);
        let hashlock = hashlock_leaf(&[1; 32], &r);

        assert!(matches!(
            parse_hashlock_leaf(&multisig),
            Err(SwapError::LeafMismatch { .. })
        ));
        assert!(matches!(
            parse_multisig_leaf(&hashlock),
            Err(SwapError::LeafMismatch { .. })
        ));
        assert!(parse_refund_leaf(&hashlock).is_err());
    }

    #[test]
    fn test_legacy_htlc_round_trip() {
        let secp = Secp256k1::new();
        let receiver = PublicKey::new(SecretKey::from_slice(&[3; 32]).unwrap().public_key(&secp));
        let refund = PublicKey::new(SecretKey::from_slice(&[4; 32]).unwrap().public_key(&secp));

        for height in [2_u32, 16, 17, 850_000] {
            let script = legacy_htlc_script(&[9; 32], &receiver, &refund, height);
            let parsed = parse_legacy_htlc(&script).unwrap();
            assert_eq!(parsed.cltv_height, height);
            assert_eq!(parsed.receiver, receiver);
            assert_eq!(parsed.refund, refund);
            assert_eq!(parsed.hashlock, [9; 32]);
        }
    }

    #[test]
    fn test_refund_leaf_rejects_non_minimal_delay() {
        let s = xonly(1);
        let build = |delay: &[u8]| {
            let mut bytes = vec![delay.len() as u8];
            bytes.extend_from_slice(delay);
            bytes.extend_from_slice(&[0xb2, 0x75, 0x20]);
            bytes.extend_from_slice(&s.serialize());
            bytes.push(0xac);
            ScriptBuf::from_bytes(bytes)
        };

        let parsed = parse_refund_leaf(&build(&[0x03, 0x00, 0x40])).unwrap();
        assert_eq!(parsed.delay.units(), 3);

        // padded with a zero byte
        assert!(matches!(
            parse_refund_leaf(&build(&[0x03, 0x00, 0x40, 0x00])),
            Err(SwapError::LeafMismatch { .. })
        ));
        // wider than a 4-byte operand
        assert!(matches!(
            parse_refund_leaf(&build(&[0x03, 0x00, 0x40, 0x00, 0x01])),
            Err(SwapError::LeafMismatch { .. })
        ));
    }

    #[test]
    fn test_x_only_length_is_checked() {
        let key = xonly(5);
        assert_eq!(x_only_from_slice("receiver", &key.serialize()).unwrap(), key);
        assert!(matches!(
            x_only_from_slice("receiver", &[2; 33]),
            Err(SwapError::InvalidLength { expected: 32, actual: 33, .. })
        ));
    }
}

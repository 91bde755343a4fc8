//! # Memo Codec
//!
//! Fixed-layout records carried in `OP_RETURN` outputs. Every record kind has a distinct
//! length, which is how [`Memo::decode`] tells them apart:
//!
//! | kind     | bytes | layout |
//! |----------|-------|--------|
//! | commit   | 78    | commitId 32, timelock u48 BE, dstChain 4, dstAddress 20, dstAsset 4, srcReceiver 12 |
//! | lock     | 77    | lockId 32, hashlock 32, csvSequence u40 BE, dstChain 4, dstAsset 4 |
//! | add-lock | 69    | commitId 32, hashlock 32, csvSequence u40 BE |
//! | refund   | 32    | commitId 32 |
//! | redeem   | 79    | commitId prefix 15, hashlock 32, secret 32 |
//!
//! String fields are ASCII, NUL-padded on the right. Values longer than their slot are
//! truncated when the memo is built, so a constructed memo always round-trips.

use bitcoin::script::{Instruction, PushBytesBuf};
use bitcoin::{Script, ScriptBuf, Transaction};
use log::warn;
use serde::{Serialize, Serializer};

use crate::config::protocol::{
    CSV_DISABLE_FLAG, CSV_TYPE_FLAG, CSV_UNIT_SECS, CSV_VALUE_MASK, MAX_OP_RETURN_BYTES,
};
use crate::error::{SwapError, SwapResult};

const MAX_U48: u64 = (1 << 48) - 1;

/// ASCII text stored in an `N`-byte NUL-padded slot
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PaddedAscii<const N: usize>([u8; N]);

impl<const N: usize> PaddedAscii<N> {
    /// Build from text, truncating to `N` bytes.
    ///
    /// Non-ASCII text and embedded NULs are rejected: the first cannot be truncated on a
    /// byte boundary safely, the second would be indistinguishable from padding.
    pub fn new(field: &str, value: &str) -> SwapResult<Self> {
        if !value.is_ascii() {
            return Err(SwapError::input(field, "memo text must be ASCII"));
        }
        if value.bytes().any(|b| b == 0) {
            return Err(SwapError::input(field, "memo text must not contain NUL"));
        }
        if value.len() > N {
            warn!(
                "Truncating memo field {} from {} to {} bytes: '{}' -> '{}'",
                field,
                value.len(),
                N,
                value,
                &value[..N]
            );
        }
        let mut slot = [0u8; N];
        let len = value.len().min(N);
        slot[..len].copy_from_slice(&value.as_bytes()[..len]);
        Ok(Self(slot))
    }

    /// Parse a padded slot read from chain
    pub fn from_slot(field: &str, slot: [u8; N]) -> SwapResult<Self> {
        let len = slot.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
        let text = &slot[..len];
        if !text.is_ascii() || text.contains(&0) {
            return Err(SwapError::input(field, "memo slot is not NUL-padded ASCII"));
        }
        Ok(Self(slot))
    }

    pub fn as_str(&self) -> &str {
        let len = self.0.iter().position(|b| *b == 0).unwrap_or(N);
        std::str::from_utf8(&self.0[..len]).unwrap_or_default()
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> std::fmt::Debug for PaddedAscii<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl<const N: usize> Serialize for PaddedAscii<N> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// A fixed-length record that can live in an `OP_RETURN` push
pub trait MemoPayload: Sized {
    const LEN: usize;

    fn encode(&self) -> SwapResult<Vec<u8>>;

    fn decode(bytes: &[u8]) -> SwapResult<Self>;
}

/// Commitment published by the sender in the commit transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitLog {
    #[serde(with = "hex::serde")]
    pub commit_id: [u8; 32],
    /// UNIX seconds, at most 48 bits
    pub timelock: u64,
    pub dst_chain: PaddedAscii<4>,
    #[serde(with = "hex::serde")]
    pub dst_address: [u8; 20],
    pub dst_asset: PaddedAscii<4>,
    pub src_receiver: PaddedAscii<12>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockMemo {
    #[serde(with = "hex::serde")]
    pub lock_id: [u8; 32],
    #[serde(with = "hex::serde")]
    pub hashlock: [u8; 32],
    pub csv_sequence: u32,
    pub dst_chain: PaddedAscii<4>,
    pub dst_asset: PaddedAscii<4>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AddLockMemo {
    #[serde(with = "hex::serde")]
    pub commit_id: [u8; 32],
    #[serde(with = "hex::serde")]
    pub hashlock: [u8; 32],
    pub csv_sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefundMemo {
    #[serde(with = "hex::serde")]
    pub commit_id: [u8; 32],
}

/// Published with the redeem; carries the secret in clear
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedeemMemo {
    #[serde(with = "hex::serde")]
    pub commit_id_prefix: [u8; 15],
    #[serde(with = "hex::serde")]
    pub hashlock: [u8; 32],
    #[serde(with = "hex::serde")]
    pub secret: [u8; 32],
}

impl RedeemMemo {
    pub fn new(commit_id: &[u8; 32], hashlock: [u8; 32], secret: [u8; 32]) -> Self {
        let mut commit_id_prefix = [0u8; 15];
        commit_id_prefix.copy_from_slice(&commit_id[..15]);
        Self {
            commit_id_prefix,
            hashlock,
            secret,
        }
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(kind: &str, bytes: &'a [u8], expected: usize) -> SwapResult<Self> {
        if bytes.len() != expected {
            return Err(SwapError::length(format!("{} memo", kind), expected, bytes.len()));
        }
        Ok(Self { bytes, offset: 0 })
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.offset..self.offset + N]);
        self.offset += N;
        out
    }

    fn uint_be(&mut self, width: usize) -> u64 {
        let value = self.bytes[self.offset..self.offset + width]
            .iter()
            .fold(0u64, |acc, b| (acc << 8) | u64::from(*b));
        self.offset += width;
        value
    }
}

fn uint_be(value: u64, width: usize) -> Vec<u8> {
    value.to_be_bytes()[8 - width..].to_vec()
}

fn sequence_field(value: u64) -> SwapResult<u32> {
    u32::try_from(value)
        .map_err(|_| SwapError::input("csv_sequence", format!("{} does not fit 32 bits", value)))
}

impl MemoPayload for CommitLog {
    const LEN: usize = 78;

    fn encode(&self) -> SwapResult<Vec<u8>> {
        if self.timelock > MAX_U48 {
            return Err(SwapError::InvalidTimelock {
                message: format!("timelock {} does not fit 48 bits", self.timelock),
            });
        }
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.commit_id);
        out.extend(uint_be(self.timelock, 6));
        out.extend_from_slice(self.dst_chain.as_bytes());
        out.extend_from_slice(&self.dst_address);
        out.extend_from_slice(self.dst_asset.as_bytes());
        out.extend_from_slice(self.src_receiver.as_bytes());
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> SwapResult<Self> {
        let mut r = Reader::new("commit", bytes, Self::LEN)?;
        Ok(Self {
            commit_id: r.take(),
            timelock: r.uint_be(6),
            dst_chain: PaddedAscii::from_slot("dst_chain", r.take())?,
            dst_address: r.take(),
            dst_asset: PaddedAscii::from_slot("dst_asset", r.take())?,
            src_receiver: PaddedAscii::from_slot("src_receiver", r.take())?,
        })
    }
}

impl MemoPayload for LockMemo {
    const LEN: usize = 77;

    fn encode(&self) -> SwapResult<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.lock_id);
        out.extend_from_slice(&self.hashlock);
        out.extend(uint_be(u64::from(self.csv_sequence), 5));
        out.extend_from_slice(self.dst_chain.as_bytes());
        out.extend_from_slice(self.dst_asset.as_bytes());
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> SwapResult<Self> {
        let mut r = Reader::new("lock", bytes, Self::LEN)?;
        Ok(Self {
            lock_id: r.take(),
            hashlock: r.take(),
            csv_sequence: sequence_field(r.uint_be(5))?,
            dst_chain: PaddedAscii::from_slot("dst_chain", r.take())?,
            dst_asset: PaddedAscii::from_slot("dst_asset", r.take())?,
        })
    }
}

impl MemoPayload for AddLockMemo {
    const LEN: usize = 69;

    fn encode(&self) -> SwapResult<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.commit_id);
        out.extend_from_slice(&self.hashlock);
        out.extend(uint_be(u64::from(self.csv_sequence), 5));
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> SwapResult<Self> {
        let mut r = Reader::new("add-lock", bytes, Self::LEN)?;
        Ok(Self {
            commit_id: r.take(),
            hashlock: r.take(),
            csv_sequence: sequence_field(r.uint_be(5))?,
        })
    }
}

impl MemoPayload for RefundMemo {
    const LEN: usize = 32;

    fn encode(&self) -> SwapResult<Vec<u8>> {
        Ok(self.commit_id.to_vec())
    }

    fn decode(bytes: &[u8]) -> SwapResult<Self> {
        let mut r = Reader::new("refund", bytes, Self::LEN)?;
        Ok(Self {
            commit_id: r.take(),
        })
    }
}

impl MemoPayload for RedeemMemo {
    const LEN: usize = 79;

    fn encode(&self) -> SwapResult<Vec<u8>> {
        let mut out = Vec::with_capacity(Self::LEN);
        out.extend_from_slice(&self.commit_id_prefix);
        out.extend_from_slice(&self.hashlock);
        out.extend_from_slice(&self.secret);
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> SwapResult<Self> {
        let mut r = Reader::new("redeem", bytes, Self::LEN)?;
        Ok(Self {
            commit_id_prefix: r.take(),
            hashlock: r.take(),
            secret: r.take(),
        })
    }
}

/// Any memo this engine writes, or the raw bytes of one it does not recognise
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Memo {
    Commit(CommitLog),
    Lock(LockMemo),
    AddLock(AddLockMemo),
    Refund(RefundMemo),
    Redeem(RedeemMemo),
    Unknown {
        #[serde(with = "hex::serde")]
        raw: Vec<u8>,
    },
}

impl Memo {
    /// Decode by length. Payloads of a known length whose fields do not parse come
    /// back as `Unknown` as well.
    pub fn decode(bytes: &[u8]) -> Memo {
        let decoded = match bytes.len() {
            n if n == CommitLog::LEN => CommitLog::decode(bytes).map(Memo::Commit),
            n if n == LockMemo::LEN => LockMemo::decode(bytes).map(Memo::Lock),
            n if n == AddLockMemo::LEN => AddLockMemo::decode(bytes).map(Memo::AddLock),
            n if n == RefundMemo::LEN => RefundMemo::decode(bytes).map(Memo::Refund),
            n if n == RedeemMemo::LEN => RedeemMemo::decode(bytes).map(Memo::Redeem),
            _ => Err(SwapError::input("memo", "unrecognised length")),
        };
        decoded.unwrap_or_else(|_| Memo::Unknown {
            raw: bytes.to_vec(),
        })
    }

    pub fn encode(&self) -> SwapResult<Vec<u8>> {
        match self {
            Memo::Commit(m) => m.encode(),
            Memo::Lock(m) => m.encode(),
            Memo::AddLock(m) => m.encode(),
            Memo::Refund(m) => m.encode(),
            Memo::Redeem(m) => m.encode(),
            Memo::Unknown { raw } => Ok(raw.clone()),
        }
    }

    /// `OP_RETURN <payload>` for this memo
    pub fn to_script(&self) -> SwapResult<ScriptBuf> {
        op_return_script(&self.encode()?)
    }
}

/// `OP_RETURN <payload>`, rejecting payloads over the relay cap.
pub fn op_return_script(payload: &[u8]) -> SwapResult<ScriptBuf> {
    if payload.len() > MAX_OP_RETURN_BYTES {
        return Err(SwapError::input(
            "op_return",
            format!(
                "payload is {} bytes, limit is {}",
                payload.len(),
                MAX_OP_RETURN_BYTES
            ),
        ));
    }
    let push = PushBytesBuf::try_from(payload.to_vec())
        .map_err(|e| SwapError::input("op_return", e.to_string()))?;
    Ok(ScriptBuf::new_op_return(&push))
}

/// Every data push following `OP_RETURN`; empty for other scripts.
pub fn extract_op_return_payloads(script: &Script) -> Vec<Vec<u8>> {
    if !script.is_op_return() {
        return Vec::new();
    }
    script
        .instructions()
        .skip(1)
        .map_while(|instruction| match instruction {
            Ok(Instruction::PushBytes(bytes)) => Some(Some(bytes.as_bytes().to_vec())),
            Ok(Instruction::Op(_)) => Some(None),
            Err(_) => None,
        })
        .flatten()
        .collect()
}

/// Decoded memos per `OP_RETURN` output index
pub fn decode_transaction_memos(tx: &Transaction) -> Vec<(u32, Vec<Memo>)> {
    tx.output
        .iter()
        .enumerate()
        .filter(|(_, out)| out.script_pubkey.is_op_return())
        .map(|(vout, out)| {
            let memos = extract_op_return_payloads(&out.script_pubkey)
                .iter()
                .map(|payload| Memo::decode(payload))
                .collect();
            (vout as u32, memos)
        })
        .collect()
}

/// Whether `sequence` encodes an enabled, time-based relative lock
pub fn is_csv_time_based(sequence: u32) -> bool {
    sequence & CSV_DISABLE_FLAG == 0 && sequence & CSV_TYPE_FLAG != 0
}

/// Relative delay in seconds for a time-based sequence
pub fn sequence_to_seconds(sequence: u32) -> Option<u64> {
    is_csv_time_based(sequence).then(|| u64::from(sequence & CSV_VALUE_MASK) * CSV_UNIT_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, TxOut};

    fn sample_commit() -> CommitLog {
        CommitLog {
            commit_id: [0x11; 32],
            timelock: 1_750_000_000,
            dst_chain: PaddedAscii::new("dst_chain", "ETH").unwrap(),
            dst_address: [0x22; 20],
            dst_asset: PaddedAscii::new("dst_asset", "USDC").unwrap(),
            src_receiver: PaddedAscii::new("src_receiver", "tb1qreceiver").unwrap(),
        }
    }

    #[test]
    fn test_commit_log_layout() {
        let bytes = sample_commit().encode().unwrap();
        assert_eq!(bytes.len(), 78);
        assert_eq!(&bytes[..32], &[0x11; 32]);
        assert_eq!(&bytes[32..38], &uint_be(1_750_000_000, 6)[..]);
        assert_eq!(&bytes[38..42], b"ETH\0");
        assert_eq!(&bytes[42..62], &[0x22; 20]);
        assert_eq!(&bytes[62..66], b"USDC");
        assert_eq!(&bytes[66..78], b"tb1qreceiver");

        assert_eq!(CommitLog::decode(&bytes).unwrap(), sample_commit());
    }

    #[test]
    fn test_lock_memo_layout() {
        let memo = LockMemo {
            lock_id: [0x33; 32],
            hashlock: [0x44; 32],
            csv_sequence: 0x0040_0003,
            dst_chain: PaddedAscii::new("dst_chain", "SOL").unwrap(),
            dst_asset: PaddedAscii::new("dst_asset", "SOL").unwrap(),
        };
        let bytes = memo.encode().unwrap();
        assert_eq!(bytes.len(), 77);
        assert_eq!(&bytes[64..69], &[0x00, 0x00, 0x40, 0x00, 0x03]);
        assert_eq!(Memo::decode(&bytes), Memo::Lock(memo));
    }

    #[test]
    fn test_over_length_strings_truncate() {
        let chain = PaddedAscii::<4>::new("dst_chain", "ETHEREUM").unwrap();
        assert_eq!(chain.as_str(), "ETHE");

        let mut commit = sample_commit();
        commit.dst_chain = chain;
        let bytes = commit.encode().unwrap();
        assert_eq!(bytes.len(), 78);
        assert_eq!(CommitLog::decode(&bytes).unwrap().dst_chain.as_str(), "ETHE");
    }

    #[test]
    fn test_invalid_strings_rejected() {
        assert!(PaddedAscii::<4>::new("dst_chain", "ÉTH").is_err());
        assert!(PaddedAscii::<4>::new("dst_chain", "E\0H").is_err());
        assert!(PaddedAscii::<4>::from_slot("dst_chain", *b"E\0H\0").is_err());
        assert_eq!(
            PaddedAscii::<4>::from_slot("dst_chain", [0; 4]).unwrap().as_str(),
            ""
        );
    }

    #[test]
    fn test_timelock_must_fit_48_bits() {
        let mut commit = sample_commit();
        commit.timelock = 1 << 48;
        assert!(matches!(
            commit.encode(),
            Err(SwapError::InvalidTimelock { .. })
        ));
        commit.timelock = MAX_U48;
        assert_eq!(CommitLog::decode(&commit.encode().unwrap()).unwrap().timelock, MAX_U48);
    }

    #[test]
    fn test_decode_discriminates_by_length() {
        let add_lock = AddLockMemo {
            commit_id: [1; 32],
            hashlock: [2; 32],
            csv_sequence: 0x0040_0002,
        };
        let refund = RefundMemo { commit_id: [3; 32] };
        let redeem = RedeemMemo::new(&[4; 32], [5; 32], [6; 32]);

        assert_eq!(Memo::decode(&add_lock.encode().unwrap()), Memo::AddLock(add_lock));
        assert_eq!(Memo::decode(&refund.encode().unwrap()), Memo::Refund(refund));
        assert_eq!(Memo::decode(&redeem.encode().unwrap()), Memo::Redeem(redeem));
        assert_eq!(
            Memo::decode(&[9; 10]),
            Memo::Unknown { raw: vec![9; 10] }
        );
    }

    #[test]
    fn test_lock_memo_with_oversized_sequence_is_unknown() {
        let mut bytes = vec![0u8; 77];
        bytes[64] = 0x01;
        assert!(LockMemo::decode(&bytes).is_err());
        assert!(matches!(Memo::decode(&bytes), Memo::Unknown { .. }));
    }

    #[test]
    fn test_op_return_cap() {
        assert!(op_return_script(&[0; 80]).is_ok());
        assert!(op_return_script(&[0; 81]).is_err());

        let script = op_return_script(&[0xab; 78]).unwrap();
        assert!(script.is_op_return());
        assert_eq!(extract_op_return_payloads(&script), vec![vec![0xab; 78]]);
    }

    #[test]
    fn test_multiple_pushes_in_one_output() {
        let refund = RefundMemo { commit_id: [7; 32] }.encode().unwrap();
        let script = bitcoin::script::Builder::new()
            .push_opcode(bitcoin::opcodes::all::OP_RETURN)
            .push_slice(<&bitcoin::script::PushBytes>::try_from(refund.as_slice()).unwrap())
            .push_slice([1, 2, 3])
            .into_script();

        let payloads = extract_op_return_payloads(&script);
        assert_eq!(payloads.len(), 2);

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![
                TxOut {
                    value: Amount::from_sat(1000),
                    script_pubkey: ScriptBuf::new(),
                },
                TxOut {
                    value: Amount::ZERO,
                    script_pubkey: script,
                },
            ],
        };
        let memos = decode_transaction_memos(&tx);
        assert_eq!(memos.len(), 1);
        assert_eq!(memos[0].0, 1);
        assert_eq!(memos[0].1[0], Memo::Refund(RefundMemo { commit_id: [7; 32] }));
        assert!(matches!(memos[0].1[1], Memo::Unknown { .. }));
    }

    #[test]
    fn test_csv_helpers() {
        assert!(is_csv_time_based(0x0040_0003));
        assert!(!is_csv_time_based(0x0000_0003));
        assert!(!is_csv_time_based(0x8040_0003));
        assert_eq!(sequence_to_seconds(0x0040_0003), Some(1536));
        assert_eq!(sequence_to_seconds(0xffff_fffd), None);
    }

    #[test]
    fn test_memo_json_uses_kind_tag() {
        let json = serde_json::to_value(Memo::Commit(sample_commit())).unwrap();
        assert_eq!(json["kind"], "commit");
        assert_eq!(json["dst_chain"], "ETH");
        assert_eq!(json["dst_address"], "22".repeat(20));
    }
}

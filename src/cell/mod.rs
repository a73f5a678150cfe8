//! Cell primitives for the ledger's wire format
//!
//! Every externally-significant artifact (signed transfer bodies, broadcast
//! envelopes, transaction history) is a tree of cells: up to 1023 data bits
//! plus up to 4 references to child cells. Signatures are computed over a
//! cell's representation hash, so the layout here must be bit-exact.

pub mod boc;
pub mod dict;

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::address::Address;

/// Maximum number of data bits in a single cell
pub const MAX_BITS: usize = 1023;

/// Maximum number of references in a single cell
pub const MAX_REFS: usize = 4;

/// Immutable cell. Cloning is cheap (shared ownership).
#[derive(Clone)]
pub struct Cell {
    inner: Arc<CellInner>,
}

struct CellInner {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Cell>,
    hash: [u8; 32],
    depth: u16,
}

impl Cell {
    fn from_parts(data: Vec<u8>, bit_len: usize, refs: Vec<Cell>) -> Self {
        let depth = refs
            .iter()
            .map(|r| r.depth() + 1)
            .max()
            .unwrap_or(0);

        let mut hasher = Sha256::new();
        hasher.update(descriptors(bit_len, refs.len()));
        hasher.update(padded_data(&data, bit_len));
        for r in &refs {
            hasher.update(r.depth().to_be_bytes());
        }
        for r in &refs {
            hasher.update(r.hash());
        }
        let hash: [u8; 32] = hasher.finalize().into();

        Self {
            inner: Arc::new(CellInner {
                data,
                bit_len,
                refs,
                hash,
                depth,
            }),
        }
    }

    /// Empty cell (no bits, no refs)
    pub fn empty() -> Self {
        Self::from_parts(Vec::new(), 0, Vec::new())
    }

    /// Representation hash
    pub fn hash(&self) -> [u8; 32] {
        self.inner.hash
    }

    /// Depth of the cell tree rooted here
    pub fn depth(&self) -> u16 {
        self.inner.depth
    }

    /// Number of data bits
    pub fn bit_len(&self) -> usize {
        self.inner.bit_len
    }

    /// Raw data bytes (last byte may be partially used)
    pub fn data(&self) -> &[u8] {
        &self.inner.data
    }

    /// Child references
    pub fn refs(&self) -> &[Cell] {
        &self.inner.refs
    }

    /// Start reading this cell from the beginning
    pub fn as_slice(&self) -> CellSlice {
        CellSlice {
            cell: self.clone(),
            bit_pos: 0,
            ref_pos: 0,
        }
    }

    /// Hash as lowercase hex string
    pub fn hash_hex(&self) -> String {
        hex::encode(self.hash())
    }
}

impl PartialEq for Cell {
    fn eq(&self, other: &Self) -> bool {
        self.hash() == other.hash()
    }
}

impl Eq for Cell {}

impl fmt::Debug for Cell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cell")
            .field("bits", &self.bit_len())
            .field("refs", &self.refs().len())
            .field("hash", &self.hash_hex())
            .finish()
    }
}

/// `d1 || d2` descriptor bytes of an ordinary level-0 cell
pub(crate) fn descriptors(bit_len: usize, ref_count: usize) -> [u8; 2] {
    let d1 = ref_count as u8;
    let d2 = (bit_len / 8 + (bit_len + 7) / 8) as u8;
    [d1, d2]
}

/// Data bytes with the completion tag appended when not byte-aligned
pub(crate) fn padded_data(data: &[u8], bit_len: usize) -> Vec<u8> {
    let byte_len = (bit_len + 7) / 8;
    let mut out = data[..byte_len].to_vec();
    let rem = bit_len % 8;
    if rem != 0 {
        let last = out.len() - 1;
        let mask = 0xFFu8 << (8 - rem);
        out[last] = (out[last] & mask) | (0x80 >> rem);
    }
    out
}

fn get_bit(data: &[u8], index: usize) -> bool {
    (data[index / 8] >> (7 - index % 8)) & 1 == 1
}

/// Mutable builder producing a [`Cell`]
#[derive(Clone, Default)]
pub struct CellBuilder {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<Cell>,
}

impl CellBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bits already written
    pub fn bit_len(&self) -> usize {
        self.bit_len
    }

    /// References already written
    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    /// Whether `bits` more data bits and `refs` more references still fit
    pub fn fits(&self, bits: usize, refs: usize) -> bool {
        self.bit_len + bits <= MAX_BITS && self.refs.len() + refs <= MAX_REFS
    }

    fn ensure_bits(&self, bits: usize) -> Result<(), CellError> {
        if self.bit_len + bits > MAX_BITS {
            return Err(CellError::BitOverflow {
                have: self.bit_len,
                requested: bits,
            });
        }
        Ok(())
    }

    fn push_bit(&mut self, bit: bool) {
        if self.bit_len % 8 == 0 {
            self.data.push(0);
        }
        if bit {
            let last = self.data.len() - 1;
            self.data[last] |= 0x80 >> (self.bit_len % 8);
        }
        self.bit_len += 1;
    }

    pub fn store_bit(&mut self, bit: bool) -> Result<&mut Self, CellError> {
        self.ensure_bits(1)?;
        self.push_bit(bit);
        Ok(self)
    }

    /// Store an unsigned integer using exactly `bits` bits (at most 64)
    pub fn store_uint(&mut self, value: u64, bits: usize) -> Result<&mut Self, CellError> {
        if bits > 64 || (bits < 64 && value >> bits != 0) {
            return Err(CellError::ValueOutOfRange {
                value: value as i128,
                bits,
            });
        }
        self.ensure_bits(bits)?;
        for i in (0..bits).rev() {
            self.push_bit((value >> i) & 1 == 1);
        }
        Ok(self)
    }

    /// Store a two's-complement signed integer using exactly `bits` bits
    /// (up to 257; wider than 128 is sign-extended)
    pub fn store_int(&mut self, value: i128, bits: usize) -> Result<&mut Self, CellError> {
        if bits == 0 || bits > 257 {
            return Err(CellError::ValueOutOfRange { value, bits });
        }
        if bits < 128 {
            let min = -(1i128 << (bits - 1));
            let max = (1i128 << (bits - 1)) - 1;
            if value < min || value > max {
                return Err(CellError::ValueOutOfRange { value, bits });
            }
        }
        self.ensure_bits(bits)?;
        for i in (0..bits).rev() {
            let bit = if i >= 127 { value < 0 } else { (value >> i) & 1 == 1 };
            self.push_bit(bit);
        }
        Ok(self)
    }

    pub fn store_u8(&mut self, value: u8) -> Result<&mut Self, CellError> {
        self.store_uint(value as u64, 8)
    }

    pub fn store_u32(&mut self, value: u32) -> Result<&mut Self, CellError> {
        self.store_uint(value as u64, 32)
    }

    pub fn store_u64(&mut self, value: u64) -> Result<&mut Self, CellError> {
        self.store_uint(value, 64)
    }

    pub fn store_bytes(&mut self, bytes: &[u8]) -> Result<&mut Self, CellError> {
        self.ensure_bits(bytes.len() * 8)?;
        for byte in bytes {
            for i in (0..8).rev() {
                self.push_bit((byte >> i) & 1 == 1);
            }
        }
        Ok(self)
    }

    /// Store an amount as `VarUInteger 16` (4-bit byte length, then bytes)
    pub fn store_coins(&mut self, amount: u128) -> Result<&mut Self, CellError> {
        let byte_len = (128 - amount.leading_zeros() as usize + 7) / 8;
        if byte_len > 15 {
            return Err(CellError::ValueOutOfRange {
                value: amount as i128,
                bits: 120,
            });
        }
        self.ensure_bits(4 + byte_len * 8)?;
        self.store_uint(byte_len as u64, 4)?;
        let bytes = amount.to_be_bytes();
        self.store_bytes(&bytes[16 - byte_len..])
    }

    /// Store `addr_std` for `Some`, `addr_none` for `None`
    pub fn store_address(&mut self, address: Option<&Address>) -> Result<&mut Self, CellError> {
        match address {
            None => self.store_uint(0b00, 2),
            Some(addr) => {
                self.ensure_bits(267)?;
                self.store_uint(0b10, 2)?;
                self.store_bit(false)?;
                self.store_int(addr.workchain as i128, 8)?;
                self.store_bytes(&addr.hash)
            }
        }
    }

    pub fn store_ref(&mut self, cell: Cell) -> Result<&mut Self, CellError> {
        if self.refs.len() >= MAX_REFS {
            return Err(CellError::RefOverflow);
        }
        self.refs.push(cell);
        Ok(self)
    }

    /// Append the unread remainder of a slice (bits and refs)
    pub fn store_slice(&mut self, slice: &CellSlice) -> Result<&mut Self, CellError> {
        let bits = slice.remaining_bits();
        let refs = slice.remaining_refs();
        self.ensure_bits(bits)?;
        if self.refs.len() + refs > MAX_REFS {
            return Err(CellError::RefOverflow);
        }
        let data = slice.cell.data();
        for i in slice.bit_pos..slice.bit_pos + bits {
            self.push_bit(get_bit(data, i));
        }
        for r in &slice.cell.refs()[slice.ref_pos..] {
            self.refs.push(r.clone());
        }
        Ok(self)
    }

    /// Append every bit and ref of `cell` inline
    pub fn store_cell_contents(&mut self, cell: &Cell) -> Result<&mut Self, CellError> {
        self.store_slice(&cell.as_slice())
    }

    pub fn build(&self) -> Cell {
        Cell::from_parts(self.data.clone(), self.bit_len, self.refs.clone())
    }
}

/// Sequential reader over a [`Cell`]
#[derive(Clone)]
pub struct CellSlice {
    cell: Cell,
    bit_pos: usize,
    ref_pos: usize,
}

impl CellSlice {
    pub fn remaining_bits(&self) -> usize {
        self.cell.bit_len() - self.bit_pos
    }

    pub fn remaining_refs(&self) -> usize {
        self.cell.refs().len() - self.ref_pos
    }

    fn ensure_bits(&self, bits: usize) -> Result<(), CellError> {
        if bits > self.remaining_bits() {
            return Err(CellError::Underflow {
                requested: bits,
                remaining: self.remaining_bits(),
            });
        }
        Ok(())
    }

    pub fn load_bit(&mut self) -> Result<bool, CellError> {
        self.ensure_bits(1)?;
        let bit = get_bit(self.cell.data(), self.bit_pos);
        self.bit_pos += 1;
        Ok(bit)
    }

    pub fn load_uint(&mut self, bits: usize) -> Result<u64, CellError> {
        if bits > 64 {
            return Err(CellError::ValueOutOfRange { value: 0, bits });
        }
        self.ensure_bits(bits)?;
        let mut value = 0u64;
        for _ in 0..bits {
            value = (value << 1) | self.load_bit()? as u64;
        }
        Ok(value)
    }

    pub fn load_int(&mut self, bits: usize) -> Result<i64, CellError> {
        if bits == 0 {
            return Ok(0);
        }
        let raw = self.load_uint(bits)?;
        if bits == 64 {
            return Ok(raw as i64);
        }
        let sign = 1u64 << (bits - 1);
        Ok(if raw & sign != 0 {
            (raw | !((1u64 << bits) - 1)) as i64
        } else {
            raw as i64
        })
    }

    pub fn load_u8(&mut self) -> Result<u8, CellError> {
        Ok(self.load_uint(8)? as u8)
    }

    pub fn load_u32(&mut self) -> Result<u32, CellError> {
        Ok(self.load_uint(32)? as u32)
    }

    pub fn load_u64(&mut self) -> Result<u64, CellError> {
        self.load_uint(64)
    }

    pub fn load_bytes(&mut self, len: usize) -> Result<Vec<u8>, CellError> {
        self.ensure_bits(len * 8)?;
        (0..len).map(|_| self.load_u8()).collect()
    }

    pub fn load_coins(&mut self) -> Result<u128, CellError> {
        let len = self.load_uint(4)? as usize;
        let bytes = self.load_bytes(len)?;
        Ok(bytes.iter().fold(0u128, |acc, b| (acc << 8) | *b as u128))
    }

    /// Load `addr_none` or `addr_std`; other address forms are rejected
    pub fn load_address(&mut self) -> Result<Option<Address>, CellError> {
        match self.load_uint(2)? {
            0b00 => Ok(None),
            0b10 => {
                if self.load_bit()? {
                    return Err(CellError::Unsupported("anycast address"));
                }
                let workchain = self.load_int(8)? as i8;
                let hash = self.load_bytes(32)?;
                let mut out = [0u8; 32];
                out.copy_from_slice(&hash);
                Ok(Some(Address::new(workchain, out)))
            }
            _ => Err(CellError::Unsupported("non-standard address")),
        }
    }

    pub fn skip(&mut self, bits: usize) -> Result<(), CellError> {
        self.ensure_bits(bits)?;
        self.bit_pos += bits;
        Ok(())
    }

    pub fn load_ref(&mut self) -> Result<Cell, CellError> {
        let cell = self
            .cell
            .refs()
            .get(self.ref_pos)
            .cloned()
            .ok_or(CellError::MissingRef)?;
        self.ref_pos += 1;
        Ok(cell)
    }

    /// Materialize the unread remainder as a standalone cell
    pub fn to_cell(&self) -> Cell {
        let mut builder = CellBuilder::new();
        // remainder of a valid cell always fits into a fresh builder
        let _ = builder.store_slice(self);
        builder.build()
    }
}

/// Errors raised while building or reading cells
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    #[error("Cell bit overflow: {have} bits used, {requested} more requested")]
    BitOverflow { have: usize, requested: usize },

    #[error("Cell reference overflow (max 4 references)")]
    RefOverflow,

    #[error("Value {value} does not fit into {bits} bits")]
    ValueOutOfRange { value: i128, bits: usize },

    #[error("Cell underflow: requested {requested} bits, {remaining} remaining")]
    Underflow { requested: usize, remaining: usize },

    #[error("Cell has no more references")]
    MissingRef,

    #[error("Unexpected tag {tag:#x} while reading {what}")]
    UnexpectedTag { what: &'static str, tag: u64 },

    #[error("Unsupported cell content: {0}")]
    Unsupported(&'static str),

    #[error("Bag of cells format error: {0}")]
    BocFormat(String),
}

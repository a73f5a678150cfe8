//! Bag-of-cells serialization
//!
//! Writes the compact form (no index, no CRC). Reads any ordinary-cell BOC,
//! skipping the offset index and CRC32C trailer when present.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{descriptors, padded_data, Cell, CellError, MAX_REFS};

const BOC_MAGIC: [u8; 4] = [0xb5, 0xee, 0x9c, 0x72];

fn bytes_needed(value: usize) -> usize {
    let mut n = 1;
    while n < 8 && value >> (8 * n) != 0 {
        n += 1;
    }
    n
}

fn write_uint(out: &mut Vec<u8>, value: usize, bytes: usize) {
    for i in (0..bytes).rev() {
        out.push((value >> (8 * i)) as u8);
    }
}

/// Topologically order the unique cells of a tree, parents before children
fn collect_cells(root: &Cell) -> Vec<Cell> {
    fn visit(cell: &Cell, seen: &mut HashMap<[u8; 32], ()>, post: &mut Vec<Cell>) {
        if seen.insert(cell.hash(), ()).is_some() {
            return;
        }
        for r in cell.refs() {
            visit(r, seen, post);
        }
        post.push(cell.clone());
    }

    let mut seen = HashMap::new();
    let mut post = Vec::new();
    visit(root, &mut seen, &mut post);
    post.reverse();
    post
}

impl Cell {
    /// Serialize a single-root bag of cells
    pub fn to_boc(&self) -> Vec<u8> {
        let cells = collect_cells(self);
        let index: HashMap<[u8; 32], usize> = cells
            .iter()
            .enumerate()
            .map(|(i, c)| (c.hash(), i))
            .collect();

        let ref_size = bytes_needed(cells.len());
        let mut body = Vec::new();
        for cell in &cells {
            body.extend_from_slice(&descriptors(cell.bit_len(), cell.refs().len()));
            body.extend_from_slice(&padded_data(cell.data(), cell.bit_len()));
            for r in cell.refs() {
                write_uint(&mut body, index[&r.hash()], ref_size);
            }
        }
        let off_size = bytes_needed(body.len());

        let mut out = Vec::with_capacity(body.len() + 16);
        out.extend_from_slice(&BOC_MAGIC);
        out.push(ref_size as u8);
        out.push(off_size as u8);
        write_uint(&mut out, cells.len(), ref_size);
        write_uint(&mut out, 1, ref_size);
        write_uint(&mut out, 0, ref_size);
        write_uint(&mut out, body.len(), off_size);
        write_uint(&mut out, 0, ref_size);
        out.extend_from_slice(&body);
        out
    }

    /// Serialize to base64
    pub fn to_boc_base64(&self) -> String {
        STANDARD.encode(self.to_boc())
    }

    /// Deserialize a bag of cells that must contain exactly one root
    pub fn from_boc(bytes: &[u8]) -> Result<Cell, CellError> {
        let mut roots = from_boc_multi(bytes)?;
        if roots.len() != 1 {
            return Err(CellError::BocFormat(format!(
                "expected a single root, found {}",
                roots.len()
            )));
        }
        Ok(roots.remove(0))
    }

    /// Deserialize a base64 bag of cells with exactly one root
    pub fn from_boc_base64(encoded: &str) -> Result<Cell, CellError> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CellError::BocFormat(e.to_string()))?;
        Self::from_boc(&bytes)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CellError> {
        if n > self.remaining() {
            return Err(CellError::BocFormat("unexpected end of input".to_string()));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn uint(&mut self, n: usize) -> Result<usize, CellError> {
        Ok(self.take(n)?.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize))
    }
}

struct RawCell {
    data: Vec<u8>,
    bit_len: usize,
    refs: Vec<usize>,
}

/// Deserialize a bag of cells with any number of roots
pub fn from_boc_multi(bytes: &[u8]) -> Result<Vec<Cell>, CellError> {
    let mut r = Reader { bytes, pos: 0 };
    if r.take(4)? != BOC_MAGIC {
        return Err(CellError::BocFormat("bad magic".to_string()));
    }

    let flags = r.take(1)?[0];
    let has_index = flags & 0x80 != 0;
    let ref_size = (flags & 0x07) as usize;
    if ref_size == 0 || ref_size > 4 {
        return Err(CellError::BocFormat(format!("invalid ref size {}", ref_size)));
    }
    let off_size = r.take(1)?[0] as usize;
    if off_size == 0 || off_size > 8 {
        return Err(CellError::BocFormat(format!("invalid offset size {}", off_size)));
    }

    let cell_count = r.uint(ref_size)?;
    let root_count = r.uint(ref_size)?;
    let _absent = r.uint(ref_size)?;
    let _total_size = r.uint(off_size)?;

    // every cell takes at least its two descriptor bytes
    if cell_count.saturating_mul(2) > r.remaining() {
        return Err(CellError::BocFormat(format!(
            "{} cells do not fit in {} bytes",
            cell_count,
            r.remaining()
        )));
    }
    if root_count == 0 || root_count > cell_count {
        return Err(CellError::BocFormat(format!(
            "{} roots for {} cells",
            root_count, cell_count
        )));
    }

    let root_indices = (0..root_count)
        .map(|_| r.uint(ref_size))
        .collect::<Result<Vec<_>, _>>()?;
    if has_index {
        r.take(cell_count.saturating_mul(off_size))?;
    }

    let mut raw = Vec::with_capacity(cell_count);
    for _ in 0..cell_count {
        let d1 = r.take(1)?[0];
        let d2 = r.take(1)?[0] as usize;
        if d1 & 0x08 != 0 {
            return Err(CellError::Unsupported("exotic cell"));
        }
        if d1 & 0xE0 != 0 {
            return Err(CellError::Unsupported("cell with level mask"));
        }
        let ref_count = (d1 & 0x07) as usize;
        if ref_count > MAX_REFS {
            return Err(CellError::BocFormat(format!("cell with {} refs", ref_count)));
        }
        let byte_len = (d2 + 1) / 2;
        let mut data = r.take(byte_len)?.to_vec();

        let bit_len = if d2 % 2 == 1 {
            let last = data.len() - 1;
            let tz = data[last].trailing_zeros() as usize;
            if tz >= 8 {
                return Err(CellError::BocFormat("missing completion tag".to_string()));
            }
            data[last] &= !(1u8 << tz);
            last * 8 + (7 - tz)
        } else {
            byte_len * 8
        };
        // trailing byte carried only the completion tag
        if bit_len % 8 == 0 && data.len() > bit_len / 8 {
            data.truncate(bit_len / 8);
        }

        let refs = (0..ref_count)
            .map(|_| r.uint(ref_size))
            .collect::<Result<Vec<_>, _>>()?;
        raw.push(RawCell { data, bit_len, refs });
    }

    let mut built: Vec<Option<Cell>> = vec![None; cell_count];
    for i in (0..cell_count).rev() {
        let mut refs = Vec::with_capacity(raw[i].refs.len());
        for &child in &raw[i].refs {
            if child <= i || child >= cell_count {
                return Err(CellError::BocFormat(format!(
                    "cell {} references invalid index {}",
                    i, child
                )));
            }
            let cell = built[child]
                .clone()
                .ok_or_else(|| CellError::BocFormat("unresolved reference".to_string()))?;
            refs.push(cell);
        }
        let data = std::mem::take(&mut raw[i].data);
        built[i] = Some(Cell::from_parts(data, raw[i].bit_len, refs));
    }

    root_indices
        .into_iter()
        .map(|i| {
            built
                .get(i)
                .cloned()
                .flatten()
                .ok_or_else(|| CellError::BocFormat(format!("root index {} out of range", i)))
        })
        .collect()
}

//! `HashmapE n X` dictionaries with fixed-width keys
//!
//! Keys are handled as the low `key_bits` bits of a `u64`. Serialization picks
//! the shortest label encoding at every node so that a dictionary always
//! produces the same cell tree (and therefore the same hash) for the same
//! content.

use std::collections::BTreeMap;

use super::{Cell, CellBuilder, CellError, CellSlice};

/// Bits needed to store a length in `0..=max` (`#<= max`)
fn len_bits(max: usize) -> usize {
    (usize::BITS - max.leading_zeros()) as usize
}

fn key_to_bits(key: u64, key_bits: usize) -> Vec<bool> {
    (0..key_bits).rev().map(|i| (key >> i) & 1 == 1).collect()
}

fn bits_to_key(bits: &[bool]) -> u64 {
    bits.iter().fold(0u64, |acc, b| (acc << 1) | *b as u64)
}

enum LabelKind {
    Short,
    Long,
    Same,
}

fn choose_label(label: &[bool], max_len: usize) -> LabelKind {
    let n = label.len();
    let k = len_bits(max_len);
    let short = 1 + n + 1 + n;
    let long = 2 + k + n;
    let same = 3 + k;

    let mut kind = LabelKind::Short;
    let mut best = short;
    if long < best {
        kind = LabelKind::Long;
        best = long;
    }
    let uniform = label.windows(2).all(|w| w[0] == w[1]);
    if uniform && same < best {
        kind = LabelKind::Same;
    }
    kind
}

fn store_label(b: &mut CellBuilder, label: &[bool], max_len: usize) -> Result<(), CellError> {
    let k = len_bits(max_len);
    match choose_label(label, max_len) {
        LabelKind::Short => {
            b.store_bit(false)?;
            for _ in 0..label.len() {
                b.store_bit(true)?;
            }
            b.store_bit(false)?;
            for bit in label {
                b.store_bit(*bit)?;
            }
        }
        LabelKind::Long => {
            b.store_uint(0b10, 2)?;
            b.store_uint(label.len() as u64, k)?;
            for bit in label {
                b.store_bit(*bit)?;
            }
        }
        LabelKind::Same => {
            b.store_uint(0b11, 2)?;
            b.store_bit(label[0])?;
            b.store_uint(label.len() as u64, k)?;
        }
    }
    Ok(())
}

fn load_label(s: &mut CellSlice, max_len: usize) -> Result<Vec<bool>, CellError> {
    let k = len_bits(max_len);
    let label = if !s.load_bit()? {
        let mut n = 0;
        while s.load_bit()? {
            n += 1;
        }
        (0..n).map(|_| s.load_bit()).collect::<Result<Vec<_>, _>>()?
    } else if !s.load_bit()? {
        let n = s.load_uint(k)? as usize;
        (0..n).map(|_| s.load_bit()).collect::<Result<Vec<_>, _>>()?
    } else {
        let bit = s.load_bit()?;
        let n = s.load_uint(k)? as usize;
        vec![bit; n]
    };
    if label.len() > max_len {
        return Err(CellError::BocFormat(format!(
            "dictionary label of {} bits exceeds remaining key length {}",
            label.len(),
            max_len
        )));
    }
    Ok(label)
}

fn build_node(entries: &[(Vec<bool>, Cell)], max_len: usize) -> Result<Cell, CellError> {
    let first = &entries[0].0;
    let prefix_len = if entries.len() == 1 {
        max_len
    } else {
        (0..max_len)
            .take_while(|&i| entries.iter().all(|(k, _)| k[i] == first[i]))
            .count()
    };

    let mut b = CellBuilder::new();
    store_label(&mut b, &first[..prefix_len], max_len)?;

    if prefix_len == max_len {
        b.store_cell_contents(&entries[0].1)?;
        return Ok(b.build());
    }

    let rest = max_len - prefix_len - 1;
    let (left, right): (Vec<_>, Vec<_>) = entries
        .iter()
        .map(|(k, v)| (k[prefix_len], k[prefix_len + 1..].to_vec(), v.clone()))
        .partition(|(bit, _, _)| !*bit);
    let strip = |side: Vec<(bool, Vec<bool>, Cell)>| -> Vec<(Vec<bool>, Cell)> {
        side.into_iter().map(|(_, k, v)| (k, v)).collect()
    };

    b.store_ref(build_node(&strip(left), rest)?)?;
    b.store_ref(build_node(&strip(right), rest)?)?;
    Ok(b.build())
}

/// Build the root cell of a non-empty `Hashmap n X`.
///
/// Each value cell's bits and refs are stored inline in its leaf. Returns
/// `None` for an empty map.
pub fn serialize(key_bits: usize, entries: &BTreeMap<u64, Cell>) -> Result<Option<Cell>, CellError> {
    if entries.is_empty() {
        return Ok(None);
    }
    if key_bits == 0 || key_bits > 64 {
        return Err(CellError::ValueOutOfRange {
            value: key_bits as i128,
            bits: 64,
        });
    }
    let list: Vec<(Vec<bool>, Cell)> = entries
        .iter()
        .map(|(k, v)| (key_to_bits(*k, key_bits), v.clone()))
        .collect();
    build_node(&list, key_bits).map(Some)
}

/// Store a `HashmapE n X` (presence bit plus optional root ref)
pub fn store_dict(
    b: &mut CellBuilder,
    key_bits: usize,
    entries: &BTreeMap<u64, Cell>,
) -> Result<(), CellError> {
    match serialize(key_bits, entries)? {
        Some(root) => {
            b.store_bit(true)?;
            b.store_ref(root)?;
        }
        None => {
            b.store_bit(false)?;
        }
    }
    Ok(())
}

fn parse_node(
    cell: &Cell,
    max_len: usize,
    prefix: &mut Vec<bool>,
    out: &mut BTreeMap<u64, CellSlice>,
) -> Result<(), CellError> {
    let mut s = cell.as_slice();
    let label = load_label(&mut s, max_len)?;
    let depth = prefix.len();
    prefix.extend_from_slice(&label);

    if label.len() == max_len {
        out.insert(bits_to_key(prefix), s);
    } else {
        let rest = max_len - label.len() - 1;
        let left = s.load_ref()?;
        let right = s.load_ref()?;
        prefix.push(false);
        parse_node(&left, rest, prefix, out)?;
        prefix.pop();
        prefix.push(true);
        parse_node(&right, rest, prefix, out)?;
        prefix.pop();
    }

    prefix.truncate(depth);
    Ok(())
}

/// Parse a non-empty `Hashmap n X` rooted at `root` into key → value slice
pub fn parse(key_bits: usize, root: &Cell) -> Result<BTreeMap<u64, CellSlice>, CellError> {
    let mut out = BTreeMap::new();
    parse_node(root, key_bits, &mut Vec::with_capacity(key_bits), &mut out)?;
    Ok(out)
}

/// Load a `HashmapE n X` from a slice
pub fn load_dict(s: &mut CellSlice, key_bits: usize) -> Result<BTreeMap<u64, CellSlice>, CellError> {
    if s.load_bit()? {
        let root = s.load_ref()?;
        parse(key_bits, &root)
    } else {
        Ok(BTreeMap::new())
    }
}

//! Message layouts
//!
//! Outbound sub-messages are encoded as relaxed internal messages; the signed
//! wallet body is broadcast inside an external inbound message. Incoming
//! messages from account history are parsed only as far as their body.

use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::cell::{Cell, CellBuilder, CellError, CellSlice};

/// Per-message send flags interpreted by the wallet contract
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SendMode(pub u8);

impl SendMode {
    pub const ORDINARY: SendMode = SendMode(0);
    pub const PAY_GAS_SEPARATELY: SendMode = SendMode(1);
    pub const IGNORE_ERRORS: SendMode = SendMode(2);
    pub const DESTROY_IF_ZERO: SendMode = SendMode(32);
    pub const CARRY_REMAINING_VALUE: SendMode = SendMode(64);
    pub const CARRY_ALL_BALANCE: SendMode = SendMode(128);

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Whether every flag of `other` is set
    pub fn contains(self, other: SendMode) -> bool {
        self.0 & other.0 == other.0
    }
}

impl Default for SendMode {
    fn default() -> Self {
        SendMode::PAY_GAS_SEPARATELY | SendMode::IGNORE_ERRORS
    }
}

impl BitOr for SendMode {
    type Output = SendMode;

    fn bitor(self, rhs: Self) -> Self::Output {
        SendMode(self.0 | rhs.0)
    }
}

/// One outbound value/data transfer bundled inside a signed payload.
///
/// An empty body and no body encode identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub destination: Address,
    /// Value in nano-units
    pub value: u128,
    pub bounce: bool,
    pub state_init: Option<Cell>,
    pub body: Option<Cell>,
    /// Overrides the batch-wide default send mode
    pub mode: Option<SendMode>,
}

impl OutboundMessage {
    /// Bounceable transfer of `value` without body or state init
    pub fn new(destination: Address, value: u128) -> Self {
        Self {
            destination,
            value,
            bounce: true,
            state_init: None,
            body: None,
            mode: None,
        }
    }

    pub fn with_body(mut self, body: Cell) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_state_init(mut self, state_init: Cell) -> Self {
        self.state_init = Some(state_init);
        self
    }

    pub fn with_bounce(mut self, bounce: bool) -> Self {
        self.bounce = bounce;
        self
    }

    pub fn with_mode(mut self, mode: SendMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Encode as `int_msg_info$0` with zeroed fees and timestamps
    pub fn to_cell(&self) -> Result<Cell, CellError> {
        let mut b = CellBuilder::new();
        b.store_bit(false)?;
        b.store_bit(true)?; // ihr_disabled
        b.store_bit(self.bounce)?;
        b.store_bit(false)?; // bounced
        b.store_address(None)?;
        b.store_address(Some(&self.destination))?;
        b.store_coins(self.value)?;
        b.store_bit(false)?; // no extra currencies
        b.store_coins(0)?; // ihr_fee
        b.store_coins(0)?; // fwd_fee
        b.store_u64(0)?; // created_lt
        b.store_u32(0)?; // created_at
        store_init_and_body(&mut b, self.state_init.as_ref(), self.body.as_ref())?;
        Ok(b.build())
    }

    /// Decode an internal message produced by [`OutboundMessage::to_cell`]
    /// (or any other relaxed internal message with a standard destination)
    pub fn from_cell(cell: &Cell) -> Result<Self, CellError> {
        let mut s = cell.as_slice();
        if s.load_bit()? {
            return Err(CellError::UnexpectedTag {
                what: "internal message",
                tag: 1,
            });
        }
        let _ihr_disabled = s.load_bit()?;
        let bounce = s.load_bit()?;
        let _bounced = s.load_bit()?;
        skip_address(&mut s)?;
        let destination = s
            .load_address()?
            .ok_or(CellError::Unsupported("internal message without destination"))?;
        let value = s.load_coins()?;
        if s.load_bit()? {
            s.load_ref()?;
        }
        s.load_coins()?;
        s.load_coins()?;
        s.skip(64 + 32)?;
        let (state_init, body) = load_init_and_body(&mut s)?;

        Ok(Self {
            destination,
            value,
            bounce,
            state_init,
            body,
            mode: None,
        })
    }
}

/// External inbound message carrying a signed wallet body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalMessage {
    pub destination: Address,
    pub state_init: Option<Cell>,
    pub body: Cell,
}

impl ExternalMessage {
    /// Encode as `ext_in_msg_info$10` with zero import fee
    pub fn to_cell(&self) -> Result<Cell, CellError> {
        let mut b = CellBuilder::new();
        b.store_uint(0b10, 2)?;
        b.store_address(None)?;
        b.store_address(Some(&self.destination))?;
        b.store_coins(0)?;
        store_init_and_body(&mut b, self.state_init.as_ref(), Some(&self.body))?;
        Ok(b.build())
    }

    /// Serialized bag of cells ready for broadcast
    pub fn to_boc(&self) -> Result<Vec<u8>, CellError> {
        Ok(self.to_cell()?.to_boc())
    }
}

/// `StateInit` with code and data, no libraries or special flags
pub fn state_init(code: Cell, data: Cell) -> Result<Cell, CellError> {
    let mut b = CellBuilder::new();
    b.store_bit(false)?; // split_depth
    b.store_bit(false)?; // special
    b.store_bit(true)?;
    b.store_ref(code)?;
    b.store_bit(true)?;
    b.store_ref(data)?;
    b.store_bit(false)?; // library
    Ok(b.build())
}

/// Text comment body (op 0), continued through a snake of refs when long
pub fn comment(text: &str) -> Result<Cell, CellError> {
    fn chain(bytes: &[u8], first: bool) -> Result<Cell, CellError> {
        let mut b = CellBuilder::new();
        if first {
            b.store_u32(0)?;
        }
        let room = (crate::cell::MAX_BITS - b.bit_len()) / 8;
        let (head, tail) = bytes.split_at(bytes.len().min(room));
        b.store_bytes(head)?;
        if !tail.is_empty() {
            b.store_ref(chain(tail, false)?)?;
        }
        Ok(b.build())
    }
    chain(text.as_bytes(), true)
}

/// Extract the body of any message (internal, external in or external out)
pub fn message_body(message: &Cell) -> Result<Cell, CellError> {
    let mut s = message.as_slice();
    if !s.load_bit()? {
        // int_msg_info$0
        s.skip(3)?;
        skip_address(&mut s)?;
        skip_address(&mut s)?;
        s.load_coins()?;
        if s.load_bit()? {
            s.load_ref()?;
        }
        s.load_coins()?;
        s.load_coins()?;
        s.skip(64 + 32)?;
    } else if !s.load_bit()? {
        // ext_in_msg_info$10
        skip_address(&mut s)?;
        skip_address(&mut s)?;
        s.load_coins()?;
    } else {
        // ext_out_msg_info$11
        skip_address(&mut s)?;
        skip_address(&mut s)?;
        s.skip(64 + 32)?;
    }
    let (_, body) = load_init_and_body(&mut s)?;
    Ok(body.unwrap_or_else(Cell::empty))
}

fn store_init_and_body(
    b: &mut CellBuilder,
    state_init: Option<&Cell>,
    body: Option<&Cell>,
) -> Result<(), CellError> {
    match state_init {
        Some(init) => {
            b.store_bit(true)?;
            b.store_bit(true)?;
            b.store_ref(init.clone())?;
        }
        None => {
            b.store_bit(false)?;
        }
    }

    let empty = Cell::empty();
    let body = body.unwrap_or(&empty);
    if b.fits(1 + body.bit_len(), body.refs().len()) {
        b.store_bit(false)?;
        b.store_cell_contents(body)?;
    } else {
        b.store_bit(true)?;
        b.store_ref(body.clone())?;
    }
    Ok(())
}

fn load_init_and_body(s: &mut CellSlice) -> Result<(Option<Cell>, Option<Cell>), CellError> {
    let state_init = if s.load_bit()? {
        if s.load_bit()? {
            Some(s.load_ref()?)
        } else {
            Some(load_inline_state_init(s)?)
        }
    } else {
        None
    };

    let body = if s.load_bit()? {
        s.load_ref()?
    } else {
        s.to_cell()
    };
    let body = if body.bit_len() == 0 && body.refs().is_empty() {
        None
    } else {
        Some(body)
    };
    Ok((state_init, body))
}

fn load_inline_state_init(s: &mut CellSlice) -> Result<Cell, CellError> {
    let mut b = CellBuilder::new();
    if s.load_bit()? {
        b.store_bit(true)?;
        b.store_uint(s.load_uint(5)?, 5)?;
    } else {
        b.store_bit(false)?;
    }
    if s.load_bit()? {
        b.store_bit(true)?;
        b.store_uint(s.load_uint(2)?, 2)?;
    } else {
        b.store_bit(false)?;
    }
    // code, data, library: each a presence bit plus optional ref
    for _ in 0..3 {
        if s.load_bit()? {
            b.store_bit(true)?;
            b.store_ref(s.load_ref()?)?;
        } else {
            b.store_bit(false)?;
        }
    }
    Ok(b.build())
}

/// Skip any `MsgAddress` (none, extern, std, var)
fn skip_address(s: &mut CellSlice) -> Result<(), CellError> {
    match s.load_uint(2)? {
        0b00 => Ok(()),
        0b01 => {
            let len = s.load_uint(9)? as usize;
            s.skip(len)
        }
        0b10 => {
            skip_anycast(s)?;
            s.skip(8 + 256)
        }
        _ => {
            skip_anycast(s)?;
            let len = s.load_uint(9)? as usize;
            s.skip(32 + len)
        }
    }
}

fn skip_anycast(s: &mut CellSlice) -> Result<(), CellError> {
    if s.load_bit()? {
        let depth = s.load_uint(5)? as usize;
        s.skip(depth)?;
    }
    Ok(())
}

// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Control-queue wire format (fixed-slot rings inside shared buffers)
//! OWNERS: @accel-sched
//! STATUS: Experimental
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit + property tests below
//!
//! Layout (little-endian):
//!   header: [magic:u32, put:u32, get:u32, slots:u32]
//!   slots:  `slots` x 32 bytes
//!
//! Request slot:  [opcode:u32, reserved:u32, seq:u64, arg:u64, pad:8]
//! Response slot: [seq:u64, status:i32, opcode:u32, timestamp_ns:i64, pad:8]
//! Event slot:    [kind:u32, data:u32, timestamp_ns:i64, pad:16]
//!
//! A ring holds `slots - 1` records; empty iff `get == put`.

use crate::buffer::MappedView;
use crate::error::{Result, SchedError};
use crate::event_log::{EventKind, LogEvent};

pub const RING_MAGIC: u32 = 0x4E56_5351;
pub const HEADER_SIZE: usize = 16;
pub const SLOT_SIZE: usize = 32;

pub const OP_SWITCH_DOMAIN: u32 = 1;
pub const OP_PING: u32 = 2;

const OFF_MAGIC: usize = 0;
const OFF_PUT: usize = 4;
const OFF_GET: usize = 8;
const OFF_SLOTS: usize = 12;

pub type Slot = [u8; SLOT_SIZE];

/// Byte-addressable memory a ring lives in.
pub trait RingMemory {
    fn ring_len(&self) -> usize;
    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()>;
    fn store(&mut self, offset: usize, data: &[u8]) -> Result<()>;
}

impl RingMemory for [u8] {
    fn ring_len(&self) -> usize {
        self.len()
    }

    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        let end = offset.checked_add(out.len()).ok_or(SchedError::InvalidArgument)?;
        let src = self.get(offset..end).ok_or(SchedError::InvalidArgument)?;
        out.copy_from_slice(src);
        Ok(())
    }

    fn store(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(SchedError::InvalidArgument)?;
        let dst = self.get_mut(offset..end).ok_or(SchedError::InvalidArgument)?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

impl RingMemory for MappedView {
    fn ring_len(&self) -> usize {
        self.len()
    }

    fn load(&self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.read(offset, out)
    }

    fn store(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.write(offset, data)
    }
}

fn load_u32<M: RingMemory + ?Sized>(mem: &M, offset: usize) -> Result<u32> {
    let mut raw = [0u8; 4];
    mem.load(offset, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}

fn store_u32<M: RingMemory + ?Sized>(mem: &mut M, offset: usize, value: u32) -> Result<()> {
    mem.store(offset, &value.to_le_bytes())
}

/// Decoded and validated ring header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingHeader {
    pub put: u32,
    pub get: u32,
    pub slots: u32,
}

impl RingHeader {
    pub fn len(&self) -> u32 {
        (self.put + self.slots - self.get) % self.slots
    }

    pub fn is_empty(&self) -> bool {
        self.put == self.get
    }

    pub fn is_full(&self) -> bool {
        (self.put + 1) % self.slots == self.get
    }

    fn slot_offset(index: u32) -> usize {
        HEADER_SIZE + index as usize * SLOT_SIZE
    }
}

/// Formats `mem` as an empty ring. Returns the slot count.
pub fn ring_init<M: RingMemory + ?Sized>(mem: &mut M) -> Result<u32> {
    let slots = mem.ring_len().saturating_sub(HEADER_SIZE) / SLOT_SIZE;
    if slots < 2 {
        return Err(SchedError::InvalidArgument);
    }
    let slots = u32::try_from(slots).map_err(|_| SchedError::InvalidArgument)?;
    store_u32(mem, OFF_PUT, 0)?;
    store_u32(mem, OFF_GET, 0)?;
    store_u32(mem, OFF_SLOTS, slots)?;
    store_u32(mem, OFF_MAGIC, RING_MAGIC)?;
    Ok(slots)
}

/// Reads the header; `InvalidArgument` if it is corrupt.
pub fn ring_header<M: RingMemory + ?Sized>(mem: &M) -> Result<RingHeader> {
    if load_u32(mem, OFF_MAGIC)? != RING_MAGIC {
        return Err(SchedError::InvalidArgument);
    }
    let header = RingHeader {
        put: load_u32(mem, OFF_PUT)?,
        get: load_u32(mem, OFF_GET)?,
        slots: load_u32(mem, OFF_SLOTS)?,
    };
    let fits = (mem.ring_len().saturating_sub(HEADER_SIZE) / SLOT_SIZE) as u64;
    if header.slots < 2
        || u64::from(header.slots) > fits
        || header.put >= header.slots
        || header.get >= header.slots
    {
        return Err(SchedError::InvalidArgument);
    }
    Ok(header)
}

/// Appends one slot; `Busy` when the ring is full.
pub fn ring_push<M: RingMemory + ?Sized>(mem: &mut M, slot: &Slot) -> Result<()> {
    let header = ring_header(mem)?;
    if header.is_full() {
        return Err(SchedError::Busy);
    }
    mem.store(RingHeader::slot_offset(header.put), slot)?;
    store_u32(mem, OFF_PUT, (header.put + 1) % header.slots)
}

/// Appends one slot, discarding the oldest record when full.
pub fn ring_push_overwrite<M: RingMemory + ?Sized>(mem: &mut M, slot: &Slot) -> Result<()> {
    let header = ring_header(mem)?;
    if header.is_full() {
        store_u32(mem, OFF_GET, (header.get + 1) % header.slots)?;
    }
    mem.store(RingHeader::slot_offset(header.put), slot)?;
    store_u32(mem, OFF_PUT, (header.put + 1) % header.slots)
}

/// Pops the oldest slot, or `None` when empty.
pub fn ring_pop<M: RingMemory + ?Sized>(mem: &mut M) -> Result<Option<Slot>> {
    let header = ring_header(mem)?;
    if header.is_empty() {
        return Ok(None);
    }
    let mut slot = [0u8; SLOT_SIZE];
    mem.load(RingHeader::slot_offset(header.get), &mut slot)?;
    store_u32(mem, OFF_GET, (header.get + 1) % header.slots)?;
    Ok(Some(slot))
}

/// Copies every pending slot oldest-first without consuming them.
pub fn ring_snapshot<M: RingMemory + ?Sized>(mem: &M) -> Result<Vec<Slot>> {
    let header = ring_header(mem)?;
    let mut out = Vec::with_capacity(header.len() as usize);
    let mut idx = header.get;
    while idx != header.put {
        let mut slot = [0u8; SLOT_SIZE];
        mem.load(RingHeader::slot_offset(idx), &mut slot)?;
        out.push(slot);
        idx = (idx + 1) % header.slots;
    }
    Ok(out)
}

/// Requests an agent posts on the Send queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    SwitchDomain { seq: u64, domain_id: u64 },
    Ping { seq: u64 },
}

impl ControlRequest {
    pub fn seq(&self) -> u64 {
        match self {
            Self::SwitchDomain { seq, .. } | Self::Ping { seq } => *seq,
        }
    }

    pub fn opcode(&self) -> u32 {
        match self {
            Self::SwitchDomain { .. } => OP_SWITCH_DOMAIN,
            Self::Ping { .. } => OP_PING,
        }
    }
}

/// Decode errors for request slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[must_use = "decode errors must be handled"]
pub enum DecodeError {
    Malformed,
    Unsupported,
}

impl From<DecodeError> for SchedError {
    fn from(_: DecodeError) -> Self {
        SchedError::InvalidArgument
    }
}

pub fn encode_request(req: &ControlRequest) -> Slot {
    let mut slot = [0u8; SLOT_SIZE];
    slot[0..4].copy_from_slice(&req.opcode().to_le_bytes());
    slot[8..16].copy_from_slice(&req.seq().to_le_bytes());
    if let ControlRequest::SwitchDomain { domain_id, .. } = req {
        slot[16..24].copy_from_slice(&domain_id.to_le_bytes());
    }
    slot
}

fn le_u32(slot: &Slot, at: usize) -> u32 {
    u32::from_le_bytes([slot[at], slot[at + 1], slot[at + 2], slot[at + 3]])
}

fn le_u64(slot: &Slot, at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&slot[at..at + 8]);
    u64::from_le_bytes(raw)
}

/// Opcode and sequence number of a slot, valid or not; used to address error responses.
pub fn request_envelope(slot: &Slot) -> (u32, u64) {
    (le_u32(slot, 0), le_u64(slot, 8))
}

pub fn decode_request(slot: &Slot) -> core::result::Result<ControlRequest, DecodeError> {
    let (opcode, seq) = request_envelope(slot);
    if le_u32(slot, 4) != 0 || slot[24..].iter().any(|b| *b != 0) {
        return Err(DecodeError::Malformed);
    }
    match opcode {
        OP_SWITCH_DOMAIN => {
            let domain_id = le_u64(slot, 16);
            if domain_id == 0 {
                return Err(DecodeError::Malformed);
            }
            Ok(ControlRequest::SwitchDomain { seq, domain_id })
        }
        OP_PING => {
            if le_u64(slot, 16) != 0 {
                return Err(DecodeError::Malformed);
            }
            Ok(ControlRequest::Ping { seq })
        }
        _ => Err(DecodeError::Unsupported),
    }
}

/// Scheduler reply to one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlResponse {
    pub seq: u64,
    /// Zero or a negative errno.
    pub status: i32,
    pub opcode: u32,
    pub timestamp_ns: i64,
}

pub fn encode_response(resp: &ControlResponse) -> Slot {
    let mut slot = [0u8; SLOT_SIZE];
    slot[0..8].copy_from_slice(&resp.seq.to_le_bytes());
    slot[8..12].copy_from_slice(&resp.status.to_le_bytes());
    slot[12..16].copy_from_slice(&resp.opcode.to_le_bytes());
    slot[16..24].copy_from_slice(&resp.timestamp_ns.to_le_bytes());
    slot
}

pub fn decode_response(slot: &Slot) -> ControlResponse {
    ControlResponse {
        seq: le_u64(slot, 0),
        status: le_u32(slot, 8) as i32,
        opcode: le_u32(slot, 12),
        timestamp_ns: le_u64(slot, 16) as i64,
    }
}

pub fn encode_event(ev: &LogEvent) -> Slot {
    let mut slot = [0u8; SLOT_SIZE];
    slot[0..4].copy_from_slice(&(ev.kind as u32).to_le_bytes());
    slot[4..8].copy_from_slice(&ev.data.to_le_bytes());
    slot[8..16].copy_from_slice(&ev.timestamp.to_le_bytes());
    slot
}

pub fn decode_event(slot: &Slot) -> core::result::Result<LogEvent, DecodeError> {
    let kind = EventKind::from_raw(le_u32(slot, 0)).ok_or(DecodeError::Unsupported)?;
    Ok(LogEvent { kind, data: le_u32(slot, 4), timestamp: le_u64(slot, 8) as i64 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ring(slots: usize) -> Vec<u8> {
        let mut mem = vec![0u8; HEADER_SIZE + slots * SLOT_SIZE];
        ring_init(mem.as_mut_slice()).unwrap();
        mem
    }

    #[test]
    fn init_rejects_tiny_buffers() {
        let mut mem = vec![0u8; HEADER_SIZE + SLOT_SIZE];
        assert_eq!(ring_init(mem.as_mut_slice()).unwrap_err(), SchedError::InvalidArgument);
    }

    #[test]
    fn full_ring_reports_busy() {
        let mut mem = ring(3);
        let slot = encode_request(&ControlRequest::Ping { seq: 1 });
        ring_push(mem.as_mut_slice(), &slot).unwrap();
        ring_push(mem.as_mut_slice(), &slot).unwrap();
        assert_eq!(ring_push(mem.as_mut_slice(), &slot).unwrap_err(), SchedError::Busy);
    }

    #[test]
    fn overwrite_keeps_newest() {
        let mut mem = ring(3);
        for seq in 1..=4 {
            ring_push_overwrite(mem.as_mut_slice(), &encode_request(&ControlRequest::Ping { seq }))
                .unwrap();
        }
        let seqs: Vec<u64> = ring_snapshot(mem.as_slice())
            .unwrap()
            .iter()
            .map(|s| request_envelope(s).1)
            .collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut mem = ring(4);
        mem[OFF_PUT..OFF_PUT + 4].copy_from_slice(&9u32.to_le_bytes());
        assert_eq!(ring_pop(mem.as_mut_slice()).unwrap_err(), SchedError::InvalidArgument);
        mem[0] ^= 0xFF;
        assert_eq!(ring_header(mem.as_slice()).unwrap_err(), SchedError::InvalidArgument);
    }

    #[test]
    fn decode_rejects_zero_domain_and_unknown_opcode() {
        let mut slot = encode_request(&ControlRequest::SwitchDomain { seq: 5, domain_id: 1 });
        slot[16..24].fill(0);
        assert_eq!(decode_request(&slot), Err(DecodeError::Malformed));
        let mut slot = [0u8; SLOT_SIZE];
        slot[0] = 0x7F;
        assert_eq!(decode_request(&slot), Err(DecodeError::Unsupported));
    }

    #[test]
    fn switch_request_decodes() {
        let req = ControlRequest::SwitchDomain { seq: 42, domain_id: 7 };
        assert_eq!(decode_request(&encode_request(&req)), Ok(req));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), SLOT_SIZE)) {
            let mut slot = [0u8; SLOT_SIZE];
            slot.copy_from_slice(&bytes);
            let _ = decode_request(&slot);
            let _ = decode_event(&slot);
        }

        #[test]
        fn arbitrary_headers_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            let mut mem = bytes;
            let _ = ring_pop(mem.as_mut_slice());
            let _ = ring_snapshot(mem.as_slice());
        }
    }
}

//! First-fit allocator for evaluation stack slots.
//!
//! Each slot carries a user count. Allocation claims a contiguous run of
//! free slots with one user each; aliasing an existing value adds users;
//! releasing drops one user per slot. A slot with zero users is free and
//! must not be read again until it is rewritten.

use crate::error::SvmError;
use crate::opcode::{STACK_INVALID, STACK_SIZE};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotEventKind {
    Write,
    Read,
    Release,
}

/// One stack access, tagged with the index of the next instruction to be
/// emitted at the time of the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotEvent {
    pub instruction: usize,
    pub offset: u32,
    pub size: u32,
    pub kind: SlotEventKind,
}

#[derive(Debug, Clone)]
pub struct StackAllocator {
    users: Vec<u32>,
    peak: u32,
    trace: Option<Vec<SlotEvent>>,
}

impl StackAllocator {
    pub fn new(record_trace: bool) -> Self {
        StackAllocator {
            users: vec![0; STACK_SIZE],
            peak: 0,
            trace: record_trace.then(Vec::new),
        }
    }

    /// Claims the first run of `size` free slots. Zero-sized values get
    /// [`STACK_INVALID`] and claim nothing.
    pub fn find_offset(&mut self, size: u32, at: usize) -> Result<u32, SvmError> {
        if size == 0 {
            return Ok(STACK_INVALID);
        }
        let size = size as usize;
        let mut run = 0;
        for i in 0..self.users.len() {
            if self.users[i] == 0 {
                run += 1;
            } else {
                run = 0;
            }
            if run == size {
                let offset = i + 1 - size;
                self.users[offset..=i].iter_mut().for_each(|u| *u = 1);
                self.peak = self.peak.max((i + 1) as u32);
                self.record(at, offset as u32, size as u32, SlotEventKind::Write);
                return Ok(offset as u32);
            }
        }
        tracing::warn!(requested = size, live = self.live_slots(), "out of SVM stack space");
        Err(SvmError::StackOverflow { requested: size as u32, live: self.live_slots() })
    }

    /// Adds a user to each slot of an existing value.
    pub fn add_user(&mut self, offset: u32, size: u32) {
        for slot in self.range(offset, size) {
            self.users[slot] += 1;
        }
    }

    /// Drops one user from each slot of a value.
    pub fn release(&mut self, offset: u32, size: u32, at: usize) {
        let mut freed = false;
        for slot in self.range(offset, size) {
            self.users[slot] = self.users[slot].saturating_sub(1);
            freed |= self.users[slot] == 0;
        }
        if freed {
            self.record(at, offset, size, SlotEventKind::Release);
        }
    }

    /// Checks that every slot of a value is still live before it is read.
    pub fn read(&mut self, offset: u32, size: u32, at: usize) -> Result<(), SvmError> {
        if let Some(slot) = self.range(offset, size).find(|s| self.users[*s] == 0) {
            return Err(SvmError::StaleSlot { offset: slot as u32 });
        }
        self.record(at, offset, size, SlotEventKind::Read);
        Ok(())
    }

    pub fn is_live(&self, offset: u32) -> bool {
        self.users.get(offset as usize).is_some_and(|u| *u > 0)
    }

    pub fn live_slots(&self) -> usize {
        self.users.iter().filter(|u| **u > 0).count()
    }

    /// Highest slot index ever claimed, plus one.
    pub fn peak(&self) -> u32 {
        self.peak
    }

    pub fn take_trace(&mut self) -> Vec<SlotEvent> {
        self.trace.take().unwrap_or_default()
    }

    fn range(&self, offset: u32, size: u32) -> std::ops::Range<usize> {
        if offset == STACK_INVALID || size == 0 {
            return 0..0;
        }
        let start = offset as usize;
        start..(start + size as usize).min(self.users.len())
    }

    fn record(&mut self, at: usize, offset: u32, size: u32, kind: SlotEventKind) {
        if let Some(trace) = self.trace.as_mut() {
            trace.push(SlotEvent { instruction: at, offset, size, kind });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_reuses_released_gap() {
        let mut stack = StackAllocator::new(false);
        let a = stack.find_offset(1, 0).unwrap();
        let b = stack.find_offset(3, 0).unwrap();
        let c = stack.find_offset(1, 0).unwrap();
        assert_eq!((a, b, c), (0, 1, 4));

        stack.release(b, 3, 0);
        assert_eq!(stack.find_offset(1, 0).unwrap(), 1);
        // The remaining two-slot gap is too small for a float3.
        assert_eq!(stack.find_offset(3, 0).unwrap(), 5);
        assert_eq!(stack.peak(), 8);
    }

    #[test]
    fn aliased_values_survive_one_release() {
        let mut stack = StackAllocator::new(false);
        let slot = stack.find_offset(3, 0).unwrap();
        stack.add_user(slot, 3);
        stack.release(slot, 3, 0);
        assert!(stack.read(slot, 3, 0).is_ok());
        stack.release(slot, 3, 0);
        assert!(matches!(stack.read(slot, 3, 0), Err(SvmError::StaleSlot { offset: 0 })));
    }

    #[test]
    fn overflow_reports_live_slots() {
        let mut stack = StackAllocator::new(false);
        for _ in 0..STACK_SIZE {
            stack.find_offset(1, 0).unwrap();
        }
        let err = stack.find_offset(1, 0).unwrap_err();
        assert!(matches!(err, SvmError::StackOverflow { requested: 1, live: STACK_SIZE }));
    }

    #[test]
    fn zero_sized_values_take_no_slots() {
        let mut stack = StackAllocator::new(false);
        assert_eq!(stack.find_offset(0, 0).unwrap(), STACK_INVALID);
        assert_eq!(stack.live_slots(), 0);
        assert!(stack.read(STACK_INVALID, 0, 0).is_ok());
    }

    #[test]
    fn trace_records_accesses_in_order() {
        let mut stack = StackAllocator::new(true);
        let slot = stack.find_offset(1, 2).unwrap();
        stack.read(slot, 1, 3).unwrap();
        stack.release(slot, 1, 4);
        let kinds: Vec<_> = stack.take_trace().iter().map(|e| (e.instruction, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![(2, SlotEventKind::Write), (3, SlotEventKind::Read), (4, SlotEventKind::Release)]
        );
    }
}

//! Sync Mutex Allocator
//!
//! A sync mutex is a hardware arbitration unit that starts a group of
//! components together against one synchronization source. The pool is
//! small and fixed; each display binds one at bring-up (plus one more on
//! discrete-path SoCs) and keeps it for its lifetime.
//!
//! ```text
//!   MUTEX_BASE + m * 0x40
//!   +0x00 EN    write 1 = trigger
//!   +0x04 SOF   sync source
//!   +0x08 MOD0  member bitmask, ids 0..31
//!   +0x0c MOD1  member bitmask, ids 32..63
//!   +0x10 RST   reset pulse
//! ```
//!
//! Membership is exclusive: a component belongs to at most one mutex.

use std::collections::BTreeSet;

use crate::cmdq::CommandBatch;
use crate::component::ComponentId;
use crate::error::{DpcError, DpcResult};

pub const MUTEX_BASE: u64 = 0x1400_1000;
pub const MUTEX_STRIDE: u64 = 0x40;

pub const MUTEX_EN: u64 = 0x00;
pub const MUTEX_SOF: u64 = 0x04;
pub const MUTEX_MOD0: u64 = 0x08;
pub const MUTEX_MOD1: u64 = 0x0c;
pub const MUTEX_RST: u64 = 0x10;

/// Mutex register selected by an address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexReg {
    En,
    Sof,
    Mod0,
    Mod1,
    Rst,
}

/// Register address of mutex `m`
pub fn reg_addr(m: usize, reg: MutexReg) -> u64 {
    let off = match reg {
        MutexReg::En => MUTEX_EN,
        MutexReg::Sof => MUTEX_SOF,
        MutexReg::Mod0 => MUTEX_MOD0,
        MutexReg::Mod1 => MUTEX_MOD1,
        MutexReg::Rst => MUTEX_RST,
    };
    MUTEX_BASE + m as u64 * MUTEX_STRIDE + off
}

/// Inverse of [`reg_addr`], for hardware models
pub fn decode(addr: u64, count: usize) -> Option<(usize, MutexReg)> {
    let end = MUTEX_BASE + count as u64 * MUTEX_STRIDE;
    if addr < MUTEX_BASE || addr >= end {
        return None;
    }
    let m = ((addr - MUTEX_BASE) / MUTEX_STRIDE) as usize;
    let reg = match (addr - MUTEX_BASE) % MUTEX_STRIDE {
        MUTEX_EN => MutexReg::En,
        MUTEX_SOF => MutexReg::Sof,
        MUTEX_MOD0 => MutexReg::Mod0,
        MUTEX_MOD1 => MutexReg::Mod1,
        MUTEX_RST => MutexReg::Rst,
        _ => return None,
    };
    Some((m, reg))
}

fn mod_bit(id: ComponentId) -> (MutexReg, u32) {
    if id.0 < 32 {
        (MutexReg::Mod0, 1 << id.0)
    } else {
        (MutexReg::Mod1, 1 << (id.0 % 32))
    }
}

/// What starts a mutex's frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncSource {
    /// Explicit trigger write (command-driven panels)
    CommandDriven = 0,
    /// Output interface start of frame
    OutputSof = 1,
    /// Output interface end of frame
    OutputEof = 2,
}

impl SyncSource {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::CommandDriven),
            1 => Some(Self::OutputSof),
            2 => Some(Self::OutputEof),
            _ => None,
        }
    }
}

/// One arbitration unit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncMutex {
    pub id: usize,
    pub display: Option<usize>,
    pub members: BTreeSet<ComponentId>,
    pub source: Option<SyncSource>,
}

/// Per-mutex membership, for comparisons in tests and dumps
pub type MutexSnapshot = Vec<BTreeSet<ComponentId>>;

// =============================================================================
// Allocator
// =============================================================================

/// Fixed mutex pool
#[derive(Debug, Clone)]
pub struct MutexAllocator {
    mutexes: Vec<SyncMutex>,
}

impl MutexAllocator {
    pub fn new(count: usize) -> Self {
        Self {
            mutexes: (0..count).map(|id| SyncMutex { id, ..Default::default() }).collect(),
        }
    }

    pub fn count(&self) -> usize {
        self.mutexes.len()
    }

    pub fn get(&self, m: usize) -> DpcResult<&SyncMutex> {
        self.mutexes
            .get(m)
            .ok_or_else(|| DpcError::InvalidArgument(format!("mutex {} out of range", m)))
    }

    fn get_mut(&mut self, m: usize) -> DpcResult<&mut SyncMutex> {
        self.mutexes
            .get_mut(m)
            .ok_or_else(|| DpcError::InvalidArgument(format!("mutex {} out of range", m)))
    }

    /// Bind the first free mutex to a display
    pub fn bind(&mut self, display: usize) -> DpcResult<usize> {
        let mutex = self
            .mutexes
            .iter_mut()
            .find(|m| m.display.is_none())
            .ok_or(DpcError::MutexExhausted)?;
        mutex.display = Some(display);
        log::debug!("[disp{}] bound mutex {}", display, mutex.id);
        Ok(mutex.id)
    }

    /// Return a mutex to the pool. Members must already be removed.
    pub fn release(&mut self, m: usize) -> DpcResult<()> {
        let mutex = self.get_mut(m)?;
        if !mutex.members.is_empty() {
            log::warn!("mutex {} released with {} members", m, mutex.members.len());
        }
        *mutex = SyncMutex { id: m, ..Default::default() };
        Ok(())
    }

    /// Mutex a component is armed on
    pub fn owner_of(&self, id: ComponentId) -> Option<usize> {
        self.mutexes.iter().find(|m| m.members.contains(&id)).map(|m| m.id)
    }

    pub fn members(&self, m: usize) -> DpcResult<&BTreeSet<ComponentId>> {
        Ok(&self.get(m)?.members)
    }

    pub fn source(&self, m: usize) -> Option<SyncSource> {
        self.get(m).ok().and_then(|mutex| mutex.source)
    }

    pub fn snapshot(&self) -> MutexSnapshot {
        self.mutexes.iter().map(|m| m.members.clone()).collect()
    }

    /// Arm a component on a mutex. Re-adding a member is a no-op.
    pub fn add(&mut self, m: usize, id: ComponentId, batch: &mut CommandBatch) -> DpcResult<()> {
        if let Some(other) = self.owner_of(id) {
            if other != m {
                return Err(DpcError::MutexConflict { comp: id, mutex: other });
            }
            return Ok(());
        }
        let (reg, bit) = mod_bit(id);
        batch.write(reg_addr(m, reg), bit, bit)?;
        self.get_mut(m)?.members.insert(id);
        Ok(())
    }

    /// Disarm a component. Removing a non-member is a no-op.
    pub fn remove(&mut self, m: usize, id: ComponentId, batch: &mut CommandBatch) -> DpcResult<()> {
        if !self.get(m)?.members.contains(&id) {
            return Ok(());
        }
        let (reg, bit) = mod_bit(id);
        batch.write(reg_addr(m, reg), 0, bit)?;
        self.get_mut(m)?.members.remove(&id);
        Ok(())
    }

    /// Fix the sync source. A second, different source is refused with a
    /// warning; the first stays in force until [`MutexAllocator::disable`].
    pub fn set_sync_source(
        &mut self,
        m: usize,
        source: SyncSource,
        batch: &mut CommandBatch,
    ) -> DpcResult<()> {
        match self.get(m)?.source {
            Some(cur) if cur == source => Ok(()),
            Some(cur) => {
                log::warn!("mutex {}: sync source fixed to {:?}, ignoring {:?}", m, cur, source);
                Ok(())
            }
            None => {
                batch.write_value(reg_addr(m, MutexReg::Sof), source as u32)?;
                self.get_mut(m)?.source = Some(source);
                Ok(())
            }
        }
    }

    /// Fire the mutex
    pub fn trigger(&self, m: usize, batch: &mut CommandBatch) -> DpcResult<()> {
        self.get(m)?;
        batch.write(reg_addr(m, MutexReg::En), 1, 1)
    }

    /// Stop the mutex and clear its sync source
    pub fn disable(&mut self, m: usize, batch: &mut CommandBatch) -> DpcResult<()> {
        batch.write(reg_addr(m, MutexReg::En), 0, 1)?;
        self.get_mut(m)?.source = None;
        Ok(())
    }

    /// Reset pulse, then restore membership and sync source
    pub fn reset(&self, m: usize, batch: &mut CommandBatch) -> DpcResult<()> {
        let mutex = self.get(m)?;
        batch.write(reg_addr(m, MutexReg::Rst), 1, 1)?;
        batch.write(reg_addr(m, MutexReg::Rst), 0, 1)?;
        let (mut mod0, mut mod1) = (0u32, 0u32);
        for id in &mutex.members {
            match mod_bit(*id) {
                (MutexReg::Mod0, bit) => mod0 |= bit,
                (_, bit) => mod1 |= bit,
            }
        }
        batch.write_value(reg_addr(m, MutexReg::Mod0), mod0)?;
        batch.write_value(reg_addr(m, MutexReg::Mod1), mod1)?;
        if let Some(source) = mutex.source {
            batch.write_value(reg_addr(m, MutexReg::Sof), source as u32)?;
        }
        Ok(())
    }

    /// Whether membership is exclusive across the pool
    pub fn membership_exclusive(&self) -> bool {
        let mut seen = BTreeSet::new();
        self.mutexes.iter().flat_map(|m| m.members.iter()).all(|id| seen.insert(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmdq::Instruction;

    #[test]
    fn test_bind_until_exhausted() {
        let mut pool = MutexAllocator::new(2);
        assert_eq!(pool.bind(0).unwrap(), 0);
        assert_eq!(pool.bind(1).unwrap(), 1);
        assert!(matches!(pool.bind(2), Err(DpcError::MutexExhausted)));
        pool.release(0).unwrap();
        assert_eq!(pool.bind(2).unwrap(), 0);
    }

    #[test]
    fn test_add_is_exclusive_and_idempotent() {
        let mut pool = MutexAllocator::new(2);
        let mut batch = CommandBatch::new("test");
        pool.add(0, ComponentId::OVL0, &mut batch).unwrap();
        pool.add(0, ComponentId::OVL0, &mut batch).unwrap();
        assert_eq!(batch.len(), 1);
        let err = pool.add(1, ComponentId::OVL0, &mut batch).unwrap_err();
        assert!(matches!(err, DpcError::MutexConflict { mutex: 0, .. }));
        assert!(pool.membership_exclusive());
    }

    #[test]
    fn test_remove_non_member() {
        let mut pool = MutexAllocator::new(1);
        let mut batch = CommandBatch::new("test");
        pool.remove(0, ComponentId::DSI0, &mut batch).unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_sync_source_fixed_once() {
        let mut pool = MutexAllocator::new(1);
        let mut batch = CommandBatch::new("test");
        pool.set_sync_source(0, SyncSource::CommandDriven, &mut batch).unwrap();
        pool.set_sync_source(0, SyncSource::OutputSof, &mut batch).unwrap();
        assert_eq!(pool.source(0), Some(SyncSource::CommandDriven));
        pool.disable(0, &mut batch).unwrap();
        pool.set_sync_source(0, SyncSource::OutputSof, &mut batch).unwrap();
        assert_eq!(pool.source(0), Some(SyncSource::OutputSof));
    }

    #[test]
    fn test_decode_round_trip() {
        for reg in [MutexReg::En, MutexReg::Sof, MutexReg::Mod0, MutexReg::Mod1, MutexReg::Rst] {
            assert_eq!(decode(reg_addr(3, reg), 6), Some((3, reg)));
        }
        assert_eq!(decode(reg_addr(6, MutexReg::En), 6), None);
        assert_eq!(decode(MUTEX_BASE + 0x14, 6), None);
    }

    #[test]
    fn test_reset_restores_membership() {
        let mut pool = MutexAllocator::new(1);
        let mut batch = CommandBatch::new("test");
        pool.add(0, ComponentId::OVL1, &mut batch).unwrap();
        pool.add(0, ComponentId::DSI0, &mut batch).unwrap();
        let mut reset = CommandBatch::new("reset");
        pool.reset(0, &mut reset).unwrap();
        let expect = (1 << ComponentId::OVL1.0) | (1 << ComponentId::DSI0.0);
        assert!(reset.instructions().contains(&Instruction::Write {
            addr: reg_addr(0, MutexReg::Mod0),
            value: expect,
            mask: u32::MAX,
        }));
    }
}

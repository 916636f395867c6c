//! Breakpoint table shared by all threads of one address space.
//!
//! Software breakpoints patch the arch trap instruction over live code and
//! remember the original bytes; hardware breakpoints burn a debug-register
//! slot; method breakpoints start out symbolic (a method descriptor) and are
//! materialized once the managed runtime resolves them to an address.

use std::collections::BTreeMap;
use std::fmt;

use tracing::warn;

use crate::arch::Arch;
use crate::errors::{ServerCommandError, ServerResult};
use crate::trace::TracedProcess;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct BreakpointId(u32);

impl BreakpointId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for BreakpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct VirtualAddress {
    address: u64,
}

impl VirtualAddress {
    pub fn new(address: u64) -> Self {
        Self { address }
    }

    pub fn addr(&self) -> u64 {
        self.address
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum BreakpointKind {
    SoftwareUser,
    /// Inserted on behalf of the managed runtime rather than the user.
    SoftwareRuntime,
    Hardware { slot: u32 },
    /// Symbolic entry waiting for the runtime to resolve the method address.
    MethodPending,
}

/// Who asked for a runtime-owned breakpoint.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OwnerTag {
    MethodDescriptor(String),
    ClassInit(u32),
}

#[derive(Clone, Debug)]
pub struct Breakpoint {
    id: BreakpointId,
    address: VirtualAddress,
    kind: BreakpointKind,
    enabled: bool,
    /// What lived at `address` before we patched it; sized for the arch
    /// breakpoint instruction. Empty while the entry is symbolic.
    original_bytes: Vec<u8>,
    owner: Option<OwnerTag>,
}

impl Breakpoint {
    pub fn id(&self) -> BreakpointId {
        self.id
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    pub fn kind(&self) -> &BreakpointKind {
        &self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn owner(&self) -> Option<&OwnerTag> {
        self.owner.as_ref()
    }

    pub fn original_bytes(&self) -> &[u8] {
        &self.original_bytes
    }

    fn is_software(&self) -> bool {
        matches!(
            self.kind,
            BreakpointKind::SoftwareUser | BreakpointKind::SoftwareRuntime
        )
    }
}

/// Ordered table of breakpoints, keyed by id. Mutations are serialized by the
/// mutex the owner wraps this in.
pub struct BreakpointManager {
    table: BTreeMap<BreakpointId, Breakpoint>,
    /// The arch trap instruction; fixed per address space.
    breakpoint_insn: Vec<u8>,
    next_id: u32,
}

impl BreakpointManager {
    pub fn new(breakpoint_insn: Vec<u8>) -> Self {
        Self {
            table: BTreeMap::new(),
            breakpoint_insn,
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> BreakpointId {
        let id = BreakpointId(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.table.get(&id)
    }

    pub fn ids(&self) -> Vec<BreakpointId> {
        self.table.keys().copied().collect()
    }

    /// The enabled software breakpoint covering `addr`, if any. When several
    /// entries share the address the most recently inserted wins.
    pub fn enabled_software_at(&self, addr: VirtualAddress) -> Option<&Breakpoint> {
        self.table
            .values()
            .rev()
            .find(|b| b.enabled && b.is_software() && b.address == addr)
    }

    pub fn enabled_hardware_at(&self, addr: VirtualAddress) -> Option<&Breakpoint> {
        self.table
            .values()
            .rev()
            .find(|b| b.enabled && matches!(b.kind, BreakpointKind::Hardware { .. }) && b.address == addr)
    }

    /// Is another enabled software entry (besides `except`) keeping the trap
    /// byte at `addr` alive?
    fn patched_by_other(&self, addr: VirtualAddress, except: BreakpointId) -> bool {
        self.table
            .values()
            .any(|b| b.id != except && b.enabled && b.is_software() && b.address == addr)
    }

    /// Insert and arm a software breakpoint. Re-inserting over an already
    /// enabled breakpoint at the same address hands back the existing id and
    /// leaves memory untouched.
    pub fn insert_software(
        &mut self,
        trace: &TracedProcess,
        addr: VirtualAddress,
        kind: BreakpointKind,
        owner: Option<OwnerTag>,
    ) -> ServerResult<BreakpointId> {
        debug_assert!(matches!(
            kind,
            BreakpointKind::SoftwareUser | BreakpointKind::SoftwareRuntime
        ));

        if let Some(existing) = self.enabled_software_at(addr) {
            return Ok(existing.id);
        }

        let original_bytes = trace.read_memory(addr.addr(), self.breakpoint_insn.len())?;
        trace.write_memory(addr.addr(), &self.breakpoint_insn)?;

        let id = self.allocate_id();
        self.table.insert(
            id,
            Breakpoint {
                id,
                address: addr,
                kind,
                enabled: true,
                original_bytes,
                owner,
            },
        );
        Ok(id)
    }

    /// Arm a hardware breakpoint; fails with `InternalError` when no debug
    /// register slot is free.
    pub fn insert_hardware(
        &mut self,
        trace: &TracedProcess,
        arch: &mut dyn Arch,
        addr: VirtualAddress,
    ) -> ServerResult<BreakpointId> {
        let slot = arch.insert_hw_breakpoint(trace, addr)?;
        let id = self.allocate_id();
        self.table.insert(
            id,
            Breakpoint {
                id,
                address: addr,
                kind: BreakpointKind::Hardware { slot },
                enabled: true,
                original_bytes: Vec::new(),
                owner: None,
            },
        );
        Ok(id)
    }

    /// Record a symbolic breakpoint on a method the runtime has not compiled
    /// yet. No memory is touched until it is materialized.
    pub fn insert_method_pending(&mut self, descriptor: &str) -> BreakpointId {
        let id = self.allocate_id();
        self.table.insert(
            id,
            Breakpoint {
                id,
                address: VirtualAddress::new(0),
                kind: BreakpointKind::MethodPending,
                enabled: true,
                original_bytes: Vec::new(),
                owner: Some(OwnerTag::MethodDescriptor(descriptor.to_string())),
            },
        );
        id
    }

    /// Turn a pending method breakpoint into a concrete software breakpoint
    /// now that the runtime has resolved its address.
    pub fn materialize_method(
        &mut self,
        trace: &TracedProcess,
        id: BreakpointId,
        addr: VirtualAddress,
    ) -> ServerResult<()> {
        let pending = self
            .table
            .get(&id)
            .ok_or(ServerCommandError::NoSuchBreakpoint)?;
        if pending.kind != BreakpointKind::MethodPending {
            return Err(ServerCommandError::NoSuchBreakpoint);
        }

        let original_bytes = if self.patched_by_other(addr, id) {
            // Another entry already owns the trap byte; its originals stand in.
            self.table
                .values()
                .find(|b| b.id != id && b.enabled && b.is_software() && b.address == addr)
                .map(|b| b.original_bytes.clone())
                .unwrap_or_default()
        } else {
            let bytes = trace.read_memory(addr.addr(), self.breakpoint_insn.len())?;
            trace.write_memory(addr.addr(), &self.breakpoint_insn)?;
            bytes
        };

        let entry = self.table.get_mut(&id).expect("checked above");
        entry.kind = BreakpointKind::SoftwareRuntime;
        entry.address = addr;
        entry.original_bytes = original_bytes;
        Ok(())
    }

    /// Remove a breakpoint, restoring original bytes or freeing the slot.
    /// Already-removed ids report `NoSuchBreakpoint`.
    pub fn remove(
        &mut self,
        trace: &TracedProcess,
        arch: &mut dyn Arch,
        id: BreakpointId,
    ) -> ServerResult<()> {
        if !self.table.contains_key(&id) {
            return Err(ServerCommandError::NoSuchBreakpoint);
        }
        self.disable(trace, arch, id)?;
        self.table.remove(&id);
        Ok(())
    }

    /// Re-arm without allocating a new entry. Enabling an enabled breakpoint
    /// is a no-op.
    pub fn enable(
        &mut self,
        trace: &TracedProcess,
        arch: &mut dyn Arch,
        id: BreakpointId,
    ) -> ServerResult<()> {
        let bp = self
            .table
            .get(&id)
            .ok_or(ServerCommandError::NoSuchBreakpoint)?;
        if bp.enabled {
            return Ok(());
        }

        match bp.kind.clone() {
            BreakpointKind::SoftwareUser | BreakpointKind::SoftwareRuntime => {
                let addr = bp.address;
                if !self.patched_by_other(addr, id) {
                    trace.write_memory(addr.addr(), &self.breakpoint_insn)?;
                }
            }
            BreakpointKind::Hardware { .. } => {
                let addr = bp.address;
                let slot = arch.insert_hw_breakpoint(trace, addr)?;
                self.table.get_mut(&id).expect("present").kind = BreakpointKind::Hardware { slot };
            }
            BreakpointKind::MethodPending => {}
        }

        self.table.get_mut(&id).expect("present").enabled = true;
        Ok(())
    }

    /// Disarm without deleting. Disabled entries never patch memory.
    pub fn disable(
        &mut self,
        trace: &TracedProcess,
        arch: &mut dyn Arch,
        id: BreakpointId,
    ) -> ServerResult<()> {
        let bp = self
            .table
            .get(&id)
            .ok_or(ServerCommandError::NoSuchBreakpoint)?;
        if !bp.enabled {
            return Ok(());
        }

        match bp.kind.clone() {
            BreakpointKind::SoftwareUser | BreakpointKind::SoftwareRuntime => {
                let addr = bp.address;
                let original = bp.original_bytes.clone();
                if !self.patched_by_other(addr, id) {
                    trace.write_memory(addr.addr(), &original)?;
                }
            }
            BreakpointKind::Hardware { slot } => {
                arch.remove_hw_breakpoint(trace, slot)?;
            }
            BreakpointKind::MethodPending => {}
        }

        self.table.get_mut(&id).expect("present").enabled = false;
        Ok(())
    }

    /// Temporarily restore the original bytes so one instruction can run at
    /// the breakpoint address. The entry stays enabled.
    pub fn unpatch_for_step(&self, trace: &TracedProcess, id: BreakpointId) -> ServerResult<()> {
        let bp = self
            .table
            .get(&id)
            .ok_or(ServerCommandError::NoSuchBreakpoint)?;
        trace.write_memory(bp.address.addr(), &bp.original_bytes)?;
        Ok(())
    }

    /// Put the trap byte back after the step. Failure is logged and tolerated;
    /// the breakpoint simply will not fire again until re-enabled.
    pub fn repatch_after_step(&self, trace: &TracedProcess, id: BreakpointId) {
        let Some(bp) = self.table.get(&id) else {
            return;
        };
        if let Err(e) = trace.write_memory(bp.address.addr(), &self.breakpoint_insn) {
            warn!(%id, addr = %bp.address, error = %e, "failed to re-arm breakpoint after step");
        }
    }

    /// Restore every patched byte, e.g. before detaching. Failures are
    /// reported but do not stop the sweep.
    pub fn restore_all(&self, trace: &TracedProcess) {
        for bp in self.table.values() {
            if bp.enabled && bp.is_software() {
                if let Err(e) = trace.write_memory(bp.address.addr(), &bp.original_bytes) {
                    warn!(id = %bp.id, addr = %bp.address, error = %e, "failed to restore breakpoint");
                }
            }
        }
    }

    /// Re-read originals and re-patch every enabled software entry. Used when
    /// the address space was replaced under us (exec) or freshly created.
    pub fn reinsert_all(&mut self, trace: &TracedProcess) -> ServerResult<()> {
        let insn = self.breakpoint_insn.clone();
        for bp in self.table.values_mut() {
            if bp.enabled && bp.is_software() {
                bp.original_bytes = trace.read_memory(bp.address.addr(), insn.len())?;
                trace.write_memory(bp.address.addr(), &insn)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> BreakpointManager {
        BreakpointManager::new(vec![0xCC])
    }

    fn insert_raw(m: &mut BreakpointManager, addr: u64, enabled: bool) -> BreakpointId {
        let id = m.allocate_id();
        m.table.insert(
            id,
            Breakpoint {
                id,
                address: VirtualAddress::new(addr),
                kind: BreakpointKind::SoftwareUser,
                enabled,
                original_bytes: vec![0x90],
                owner: None,
            },
        );
        id
    }

    #[test]
    fn ids_are_monotonic_from_one() {
        let mut m = manager();
        let a = m.insert_method_pending("Foo:Bar");
        let b = m.insert_method_pending("Foo:Baz");
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 2);
    }

    #[test]
    fn most_recently_inserted_wins_at_shared_address() {
        let mut m = manager();
        let old = insert_raw(&mut m, 0x400100, true);
        let new = insert_raw(&mut m, 0x400100, true);
        let hit = m
            .enabled_software_at(VirtualAddress::new(0x400100))
            .expect("enabled entry");
        assert_eq!(hit.id(), new);
        assert_ne!(hit.id(), old);
    }

    #[test]
    fn disabled_entries_do_not_match_stops() {
        let mut m = manager();
        insert_raw(&mut m, 0x400100, false);
        assert!(m.enabled_software_at(VirtualAddress::new(0x400100)).is_none());
    }

    #[test]
    fn shared_address_tracks_other_enabled_entries() {
        let mut m = manager();
        let a = insert_raw(&mut m, 0x400100, true);
        let b = insert_raw(&mut m, 0x400100, true);
        assert!(m.patched_by_other(VirtualAddress::new(0x400100), a));
        assert!(m.patched_by_other(VirtualAddress::new(0x400100), b));
        m.table.get_mut(&a).unwrap().enabled = false;
        assert!(!m.patched_by_other(VirtualAddress::new(0x400100), b));
    }
}

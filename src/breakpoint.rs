//! Breakpoint Manager.
//!
//! Software breakpoints are one-shot: `install` patches a single `0xCC` byte and
//! records the original opcode; `handle` restores it, decrements the faulting
//! thread's instruction pointer so the original instruction re-executes, deletes the
//! record, and returns the breakpoint's classification tag for dispatch.

use std::collections::HashMap;

use crate::error::Result;
use crate::mem::ProcessMemory;

const TRAP_OPCODE: u8 = 0xCC;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BreakpointKind {
    Entrypoint,
    ModuleLoaded,
    FuzzMethod,
}

#[derive(Clone, Debug)]
pub struct BreakpointRecord {
    pub address: u64,
    pub kind: BreakpointKind,
    pub original_opcode: u8,
    pub module_name: Option<String>,
    pub module_base: Option<u64>,
}

/// Result of dispatching a breakpoint-exception debug event to the manager.
pub enum Hit {
    /// No record matched this address; the debugger should report the exception
    /// as unhandled.
    Unknown,
    Known(BreakpointRecord),
}

#[derive(Default)]
pub struct BreakpointManager {
    // Invariant: for every entry, the byte at `address` in the traced process is
    // `TRAP_OPCODE`, and this map alone holds the original byte. No two entries
    // share an address.
    records: HashMap<u64, BreakpointRecord>,
}

impl BreakpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn install(
        &mut self,
        mem: &dyn ProcessMemory,
        address: u64,
        kind: BreakpointKind,
        module_name: Option<String>,
        module_base: Option<u64>,
    ) -> Result<()> {
        let original_opcode = mem.read_u8(address)?;
        mem.write_u8(address, TRAP_OPCODE)?;
        mem.flush_icache(address, 1)?;

        self.records.insert(
            address,
            BreakpointRecord {
                address,
                kind,
                original_opcode,
                module_name,
                module_base,
            },
        );
        Ok(())
    }

    /// Services a breakpoint exception at `address`. On a known address, restores
    /// the original opcode, rewinds the instruction pointer by one byte via
    /// `rewind_ip`, and removes the one-shot record before returning it.
    pub fn handle(
        &mut self,
        mem: &dyn ProcessMemory,
        address: u64,
        mut rewind_ip: impl FnMut() -> Result<()>,
    ) -> Result<Hit> {
        let record = match self.records.remove(&address) {
            Some(r) => r,
            None => return Ok(Hit::Unknown),
        };

        mem.write_u8(address, record.original_opcode)?;
        mem.flush_icache(address, 1)?;
        rewind_ip()?;

        Ok(Hit::Known(record))
    }

    pub fn is_installed(&self, address: u64) -> bool {
        self.records.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::mock::MockProcessMemory;

    #[test]
    fn opcode_preservation_across_install_hit_cycles() {
        let mem = MockProcessMemory::new();
        let mut mgr = BreakpointManager::new();
        let addr = 0x4010_00u64;
        mem.seed(addr, &[0x55]); // original opcode: push rbp

        for _ in 0..5 {
            mgr.install(&mem, addr, BreakpointKind::FuzzMethod, None, None).unwrap();
            assert_eq!(mem.snapshot(addr, 1), vec![TRAP_OPCODE]);

            let hit = mgr.handle(&mem, addr, || Ok(())).unwrap();
            assert!(matches!(hit, Hit::Known(_)));
            assert_eq!(mem.snapshot(addr, 1), vec![0x55]);
        }
    }

    #[test]
    fn one_shot_breakpoints() {
        let mem = MockProcessMemory::new();
        let mut mgr = BreakpointManager::new();
        let addr = 0x1000u64;
        mem.seed(addr, &[0x90]);

        mgr.install(&mem, addr, BreakpointKind::Entrypoint, None, None).unwrap();
        let first = mgr.handle(&mem, addr, || Ok(())).unwrap();
        assert!(matches!(first, Hit::Known(_)));

        let second = mgr.handle(&mem, addr, || Ok(())).unwrap();
        assert!(matches!(second, Hit::Unknown));
    }

    #[test]
    fn restore_is_byte_identical_to_pre_install() {
        let mem = MockProcessMemory::new();
        let mut mgr = BreakpointManager::new();
        let addr = 0x2000u64;
        let original = [0x48, 0x89, 0x5c, 0x24, 0x08]; // sub rsp prologue bytes
        mem.seed(addr, &original);
        let before = mem.snapshot(addr, original.len());

        mgr.install(&mem, addr, BreakpointKind::ModuleLoaded, Some("foo.dll".into()), Some(0x1_0000))
            .unwrap();
        mgr.handle(&mem, addr, || Ok(())).unwrap();

        assert_eq!(mem.snapshot(addr, original.len()), before);
    }

    #[test]
    fn rewind_ip_runs_only_on_known_address() {
        let mem = MockProcessMemory::new();
        let mut mgr = BreakpointManager::new();
        mem.seed(0x10, &[0x90]);
        mgr.install(&mem, 0x10, BreakpointKind::FuzzMethod, None, None).unwrap();

        let mut rewound = false;
        mgr.handle(&mem, 0x99, || {
            rewound = true;
            Ok(())
        })
        .unwrap();
        assert!(!rewound, "rewind must not run for an unknown address");

        mgr.handle(&mem, 0x10, || {
            rewound = true;
            Ok(())
        })
        .unwrap();
        assert!(rewound);
    }

    #[test]
    fn no_two_records_share_an_address() {
        let mem = MockProcessMemory::new();
        let mut mgr = BreakpointManager::new();
        mem.seed(0x10, &[0x90]);
        mgr.install(&mem, 0x10, BreakpointKind::Entrypoint, None, None).unwrap();
        assert_eq!(mgr.len(), 1);
        // Reinstalling at the same address overwrites, never duplicates.
        mgr.install(&mem, 0x10, BreakpointKind::FuzzMethod, None, None).unwrap();
        assert_eq!(mgr.len(), 1);
    }
}

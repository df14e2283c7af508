//! Argument capture/restore per calling convention.
//!
//! `RegisterState` is a flat snapshot of the handful of general-purpose registers the
//! supported calling conventions actually read arguments out of. Everything here is
//! pure: it takes a `RegisterState` plus a `ProcessMemory` capability and
//! produces/consumes argument values, so the calling-convention logic is testable
//! without a live thread.

use crate::config::CallConv;
use crate::error::Result;
use crate::mem::ProcessMemory;

/// A flat snapshot of the registers the engine cares about: instruction pointer,
/// stack pointer, and up to four integer argument registers (Rcx/Rdx/R8/R9 on
/// ms-x64, Ecx/Edx on fastcall/thiscall, unused on cdecl).
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterState {
    pub ip: u64,
    pub sp: u64,
    pub arg_regs: [u64; 4],
}

/// Pointer size in bytes implied by the process bitness the harness was built for.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Arch {
    X86,
    X64,
}

impl Arch {
    pub fn ptr_size(self) -> usize {
        match self {
            Arch::X86 => 4,
            Arch::X64 => 8,
        }
    }
}

/// Reads `num_args` argument values out of registers and/or the stack.
///
/// The stack-argument starting offset for fastcall/thiscall is `[sp + ptr_size]` for
/// the slots beyond the register-passed ones, without skipping the two/one
/// register-passed argument slots' would-be stack positions. This is a known
/// discrepancy, preserved deliberately rather than silently corrected.
pub fn capture_args(
    callconv: CallConv,
    arch: Arch,
    num_args: u32,
    regs: &RegisterState,
    mem: &dyn ProcessMemory,
) -> Result<Vec<u64>> {
    let ptr = arch.ptr_size() as u64;
    let n = num_args as usize;
    let mut args = vec![0u64; n];

    match callconv {
        CallConv::MsX64 => {
            for (i, slot) in args.iter_mut().enumerate().take(n.min(4)) {
                *slot = regs.arg_regs[i];
            }
            if n > 4 {
                read_stack_args(mem, regs.sp + 5 * ptr, &mut args[4..], ptr)?;
            }
        }
        CallConv::Cdecl => {
            read_stack_args(mem, regs.sp + ptr, &mut args[..], ptr)?;
        }
        CallConv::Fastcall => {
            if n > 0 {
                args[0] = regs.arg_regs[0];
            }
            if n > 1 {
                args[1] = regs.arg_regs[1];
            }
            if n > 2 {
                read_stack_args(mem, regs.sp + ptr, &mut args[2..], ptr)?;
            }
        }
        CallConv::Thiscall => {
            if n > 0 {
                args[0] = regs.arg_regs[0];
            }
            if n > 1 {
                read_stack_args(mem, regs.sp + ptr, &mut args[1..], ptr)?;
            }
        }
    }

    Ok(args)
}

/// Writes previously captured argument values back to registers/stack, the mirror
/// image of `capture_args`, used on every re-entry.
pub fn restore_args(
    callconv: CallConv,
    arch: Arch,
    args: &[u64],
    regs: &mut RegisterState,
    mem: &dyn ProcessMemory,
) -> Result<()> {
    let ptr = arch.ptr_size() as u64;
    let n = args.len();

    match callconv {
        CallConv::MsX64 => {
            for (i, value) in args.iter().enumerate().take(n.min(4)) {
                regs.arg_regs[i] = *value;
            }
            if n > 4 {
                write_stack_args(mem, regs.sp + 5 * ptr, &args[4..], ptr)?;
            }
        }
        CallConv::Cdecl => {
            write_stack_args(mem, regs.sp + ptr, args, ptr)?;
        }
        CallConv::Fastcall => {
            if n > 0 {
                regs.arg_regs[0] = args[0];
            }
            if n > 1 {
                regs.arg_regs[1] = args[1];
            }
            if n > 2 {
                write_stack_args(mem, regs.sp + ptr, &args[2..], ptr)?;
            }
        }
        CallConv::Thiscall => {
            if n > 0 {
                regs.arg_regs[0] = args[0];
            }
            if n > 1 {
                write_stack_args(mem, regs.sp + ptr, &args[1..], ptr)?;
            }
        }
    }

    Ok(())
}

fn read_stack_args(mem: &dyn ProcessMemory, base: u64, out: &mut [u64], ptr: u64) -> Result<()> {
    for (i, slot) in out.iter_mut().enumerate() {
        *slot = mem.read_usize(base + i as u64 * ptr, ptr as usize)?;
    }
    Ok(())
}

fn write_stack_args(mem: &dyn ProcessMemory, base: u64, values: &[u64], ptr: u64) -> Result<()> {
    for (i, value) in values.iter().enumerate() {
        mem.write_usize(base + i as u64 * ptr, *value, ptr as usize)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::mock::MockProcessMemory;

    fn regs_with(arg_regs: [u64; 4], sp: u64) -> RegisterState {
        RegisterState { ip: 0, sp, arg_regs }
    }

    #[test]
    fn ms_x64_reads_four_registers_then_stack() {
        let mem = MockProcessMemory::new();
        let sp = 0x1000u64;
        mem.write_usize(sp + 5 * 8, 0xAAAA, 8).unwrap();
        mem.write_usize(sp + 6 * 8, 0xBBBB, 8).unwrap();

        let regs = regs_with([1, 2, 3, 4], sp);
        let args = capture_args(CallConv::MsX64, Arch::X64, 6, &regs, &mem).unwrap();
        assert_eq!(args, vec![1, 2, 3, 4, 0xAAAA, 0xBBBB]);
    }

    #[test]
    fn cdecl_reads_all_args_from_stack_starting_at_one_slot_past_sp() {
        let mem = MockProcessMemory::new();
        let sp = 0x2000u64;
        mem.write_usize(sp + 4, 10, 4).unwrap();
        mem.write_usize(sp + 8, 20, 4).unwrap();

        let regs = regs_with([0, 0, 0, 0], sp);
        let args = capture_args(CallConv::Cdecl, Arch::X86, 2, &regs, &mem).unwrap();
        assert_eq!(args, vec![10, 20]);
    }

    #[test]
    fn fastcall_first_two_args_in_registers() {
        let mem = MockProcessMemory::new();
        let sp = 0x3000u64;
        mem.write_usize(sp + 4, 99, 4).unwrap();

        let regs = regs_with([7, 8, 0, 0], sp);
        let args = capture_args(CallConv::Fastcall, Arch::X86, 3, &regs, &mem).unwrap();
        assert_eq!(args, vec![7, 8, 99]);
    }

    #[test]
    fn thiscall_first_arg_in_ecx() {
        let mem = MockProcessMemory::new();
        let sp = 0x4000u64;
        mem.write_usize(sp + 4, 55, 4).unwrap();

        let regs = regs_with([42, 0, 0, 0], sp);
        let args = capture_args(CallConv::Thiscall, Arch::X86, 2, &regs, &mem).unwrap();
        assert_eq!(args, vec![42, 55]);
    }

    #[test]
    fn capture_then_restore_round_trips_byte_for_byte() {
        for (callconv, arch, n) in [
            (CallConv::MsX64, Arch::X64, 6u32),
            (CallConv::Cdecl, Arch::X86, 3u32),
            (CallConv::Fastcall, Arch::X86, 4u32),
            (CallConv::Thiscall, Arch::X86, 3u32),
        ] {
            let mem = MockProcessMemory::new();
            let sp = 0x5000u64;
            let ptr = arch.ptr_size() as u64;
            // Seed the stack region generously so every convention's stack window
            // for this arg count has real, distinguishable values.
            for i in 0..8u64 {
                mem.write_usize(sp + (1 + i) * ptr, 0x1000 + i, ptr as usize).unwrap();
            }
            let regs = regs_with([0x10, 0x20, 0x30, 0x40], sp);

            let captured = capture_args(callconv, arch, n, &regs, &mem).unwrap();

            // Corrupt registers/stack, then restore and recapture: must match exactly.
            let mut regs2 = regs_with([0, 0, 0, 0], sp);
            for i in 0..8u64 {
                mem.write_usize(sp + (1 + i) * ptr, 0, ptr as usize).unwrap();
            }
            restore_args(callconv, arch, &captured, &mut regs2, &mem).unwrap();
            let recaptured = capture_args(callconv, arch, n, &regs2, &mem).unwrap();

            assert_eq!(captured, recaptured, "{callconv:?}/{arch:?} round trip mismatch");
        }
    }
}

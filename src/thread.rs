//! Thread-context capability: opening a thread and getting/setting its register
//! snapshot.
//!
//! Like `ProcessMemory`, this is a trait so the debug-event loop's context-surgery
//! logic can be driven by a fake thread in tests.

use crate::config::CallConv;
use crate::error::Result;
use crate::mem::ProcessMemory;
use crate::registers::{capture_args, restore_args, Arch, RegisterState};

pub trait ThreadContext {
    fn get_context(&self, thread_id: u32) -> Result<RegisterState>;
    fn set_context(&self, thread_id: u32, regs: &RegisterState) -> Result<()>;
}

/// Captured once on first entry to the fuzz method and replayed on every later
/// iteration.
#[derive(Clone, Debug)]
pub struct IterationSnapshot {
    pub fuzz_thread_id: u32,
    pub fuzz_address: u64,
    pub saved_sp: u64,
    pub saved_args: Vec<u64>,
}

/// Reads the triggering thread's context, saves its stack pointer and the calling
/// convention's argument values, and overwrites the return slot at `[sp]` with the
/// sentinel. The sentinel write happens through `mem` so it is covered by the
/// memory-capability mock in tests too.
pub fn capture_on_first_entry(
    threads: &dyn ThreadContext,
    mem: &dyn ProcessMemory,
    thread_id: u32,
    fuzz_address: u64,
    callconv: CallConv,
    arch: Arch,
    num_args: u32,
    sentinel: u64,
) -> Result<IterationSnapshot> {
    let regs = threads.get_context(thread_id)?;
    let saved_sp = regs.sp;
    let saved_args = capture_args(callconv, arch, num_args, &regs, mem)?;

    mem.write_usize(saved_sp, sentinel, arch.ptr_size())?;

    Ok(IterationSnapshot {
        fuzz_thread_id: thread_id,
        fuzz_address,
        saved_sp,
        saved_args,
    })
}

/// Splices the thread back to `fuzz_address` with the saved stack pointer and
/// argument values restored, re-arming the function for the next iteration. After
/// this call the thread's IP, SP, and argument registers/stack slots byte-equal
/// those captured on first entry.
pub fn restore_for_next_iteration(
    threads: &dyn ThreadContext,
    mem: &dyn ProcessMemory,
    snapshot: &IterationSnapshot,
    callconv: CallConv,
    arch: Arch,
) -> Result<()> {
    let mut regs = threads.get_context(snapshot.fuzz_thread_id)?;
    regs.ip = snapshot.fuzz_address;
    regs.sp = snapshot.saved_sp;
    restore_args(callconv, arch, &snapshot.saved_args, &mut regs, mem)?;
    threads.set_context(snapshot.fuzz_thread_id, &regs)
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use winapi::um::processthreadsapi::{GetThreadContext, OpenThread, SetThreadContext};
    use winapi::um::winnt::{CONTEXT, CONTEXT_ALL, HANDLE, THREAD_ALL_ACCESS};

    pub struct WindowsThreadContext;

    impl WindowsThreadContext {
        fn with_thread<T>(&self, thread_id: u32, f: impl FnOnce(HANDLE) -> Result<T>) -> Result<T> {
            let handle = unsafe { OpenThread(THREAD_ALL_ACCESS, 0, thread_id) };
            if handle.is_null() {
                return Err(crate::error::EngineError::Memory(format!(
                    "OpenThread({thread_id}) failed"
                )));
            }
            let result = f(handle);
            unsafe { winapi::um::handleapi::CloseHandle(handle) };
            result
        }
    }

    impl ThreadContext for WindowsThreadContext {
        fn get_context(&self, thread_id: u32) -> Result<RegisterState> {
            self.with_thread(thread_id, |handle| unsafe {
                let mut ctx: CONTEXT = std::mem::zeroed();
                ctx.ContextFlags = CONTEXT_ALL;
                if GetThreadContext(handle, &mut ctx) == 0 {
                    return Err(crate::error::EngineError::Memory(
                        "GetThreadContext failed".into(),
                    ));
                }
                Ok(context_to_state(&ctx))
            })
        }

        fn set_context(&self, thread_id: u32, regs: &RegisterState) -> Result<()> {
            self.with_thread(thread_id, |handle| unsafe {
                let mut ctx: CONTEXT = std::mem::zeroed();
                ctx.ContextFlags = CONTEXT_ALL;
                if GetThreadContext(handle, &mut ctx) == 0 {
                    return Err(crate::error::EngineError::Memory(
                        "GetThreadContext failed".into(),
                    ));
                }
                state_into_context(regs, &mut ctx);
                if SetThreadContext(handle, &ctx) == 0 {
                    return Err(crate::error::EngineError::Memory(
                        "SetThreadContext failed".into(),
                    ));
                }
                Ok(())
            })
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn context_to_state(ctx: &CONTEXT) -> RegisterState {
        RegisterState {
            ip: ctx.Rip,
            sp: ctx.Rsp,
            arg_regs: [ctx.Rcx, ctx.Rdx, ctx.R8, ctx.R9],
        }
    }

    #[cfg(target_arch = "x86_64")]
    unsafe fn state_into_context(regs: &RegisterState, ctx: &mut CONTEXT) {
        ctx.Rip = regs.ip;
        ctx.Rsp = regs.sp;
        ctx.Rcx = regs.arg_regs[0];
        ctx.Rdx = regs.arg_regs[1];
        ctx.R8 = regs.arg_regs[2];
        ctx.R9 = regs.arg_regs[3];
    }

    #[cfg(target_arch = "x86")]
    unsafe fn context_to_state(ctx: &CONTEXT) -> RegisterState {
        RegisterState {
            ip: ctx.Eip as u64,
            sp: ctx.Esp as u64,
            arg_regs: [ctx.Ecx as u64, ctx.Edx as u64, 0, 0],
        }
    }

    #[cfg(target_arch = "x86")]
    unsafe fn state_into_context(regs: &RegisterState, ctx: &mut CONTEXT) {
        ctx.Eip = regs.ip as u32;
        ctx.Esp = regs.sp as u32;
        ctx.Ecx = regs.arg_regs[0] as u32;
        ctx.Edx = regs.arg_regs[1] as u32;
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[derive(Default)]
    pub struct ScriptedThreadContext {
        contexts: RefCell<HashMap<u32, RegisterState>>,
    }

    impl ScriptedThreadContext {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn seed(&self, thread_id: u32, regs: RegisterState) {
            self.contexts.borrow_mut().insert(thread_id, regs);
        }
    }

    impl ThreadContext for ScriptedThreadContext {
        fn get_context(&self, thread_id: u32) -> Result<RegisterState> {
            Ok(*self.contexts.borrow().get(&thread_id).unwrap_or(&RegisterState::default()))
        }

        fn set_context(&self, thread_id: u32, regs: &RegisterState) -> Result<()> {
            self.contexts.borrow_mut().insert(thread_id, *regs);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::mock::MockProcessMemory;
    use crate::thread::mock::ScriptedThreadContext;

    #[test]
    fn context_restoration_round_trips() {
        let mem = MockProcessMemory::new();
        let threads = ScriptedThreadContext::new();
        threads.seed(
            7,
            RegisterState {
                ip: 0x1000,
                sp: 0x2000,
                arg_regs: [1, 2, 3, 4],
            },
        );

        let snapshot = capture_on_first_entry(
            &threads,
            &mem,
            7,
            0x1000,
            CallConv::MsX64,
            Arch::X64,
            4,
            0x0AF1,
        )
        .unwrap();

        // Sentinel must now occupy the saved return slot.
        assert_eq!(mem.snapshot(0x2000, 8), 0x0AF1u64.to_le_bytes());

        // Simulate the function running and clobbering registers/stack.
        threads.seed(
            7,
            RegisterState {
                ip: 0xDEAD,
                sp: 0xBEEF,
                arg_regs: [9, 9, 9, 9],
            },
        );

        restore_for_next_iteration(&threads, &mem, &snapshot, CallConv::MsX64, Arch::X64).unwrap();

        let restored = threads.get_context(7).unwrap();
        assert_eq!(restored.ip, 0x1000);
        assert_eq!(restored.sp, 0x2000);
        assert_eq!(restored.arg_regs, [1, 2, 3, 4]);
    }
}

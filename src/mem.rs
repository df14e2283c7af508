//! Cross-process memory access as a capability.
//!
//! Every place the resolver, breakpoint manager, or event loop needs to read or write the
//! traced process's address space goes
//! through this trait rather than calling `ReadProcessMemory`/`WriteProcessMemory`
//! directly, so breakpoint install/restore logic can run against an in-memory fake
//! process instead of a live Windows debuggee.

use crate::error::{EngineError, Result};

pub trait ProcessMemory {
    /// Reads exactly `buf.len()` bytes from `address` in the target process.
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `buf` to `address` in the target process.
    fn write(&self, address: u64, buf: &[u8]) -> Result<()>;

    /// Flushes the instruction cache for `[address, address + len)`. A no-op on
    /// architectures without a separate I-cache, but every write that can affect
    /// code the traced process will execute calls this, following every opcode patch
    /// with an explicit `FlushInstructionCache`.
    fn flush_icache(&self, address: u64, len: usize) -> Result<()>;

    fn read_u8(&self, address: u64) -> Result<u8> {
        let mut b = [0u8; 1];
        self.read(address, &mut b)?;
        Ok(b[0])
    }

    fn write_u8(&self, address: u64, value: u8) -> Result<()> {
        self.write(address, &[value])
    }

    fn read_usize(&self, address: u64, ptr_size: usize) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf[..ptr_size])?;
        Ok(u64::from_le_bytes(buf))
    }

    fn write_usize(&self, address: u64, value: u64, ptr_size: usize) -> Result<()> {
        let buf = value.to_le_bytes();
        self.write(address, &buf[..ptr_size])
    }
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use std::ptr::null_mut;
    use winapi::um::memoryapi::{ReadProcessMemory, WriteProcessMemory};
    use winapi::um::processthreadsapi::FlushInstructionCache;
    use winapi::um::winnt::HANDLE;

    /// Reads/writes through a live `HANDLE` to a debuggee process, the production
    /// implementation of `ProcessMemory`.
    pub struct WindowsProcessMemory {
        pub handle: HANDLE,
    }

    // `HANDLE` is just a pointer-sized OS resource id; the engine's single-threaded
    // event loop is the only thing that ever touches it.
    unsafe impl Send for WindowsProcessMemory {}

    impl ProcessMemory for WindowsProcessMemory {
        fn read(&self, address: u64, buf: &mut [u8]) -> Result<()> {
            let mut read = 0usize;
            let ok = unsafe {
                ReadProcessMemory(
                    self.handle,
                    address as *const _,
                    buf.as_mut_ptr() as *mut _,
                    buf.len(),
                    &mut read,
                )
            };
            if ok == 0 || read != buf.len() {
                return Err(EngineError::Memory(format!(
                    "ReadProcessMemory({address:#x}, {} bytes) failed",
                    buf.len()
                )));
            }
            Ok(())
        }

        fn write(&self, address: u64, buf: &[u8]) -> Result<()> {
            let mut written = 0usize;
            let ok = unsafe {
                WriteProcessMemory(
                    self.handle,
                    address as *mut _,
                    buf.as_ptr() as *const _,
                    buf.len(),
                    &mut written,
                )
            };
            if ok == 0 || written != buf.len() {
                return Err(EngineError::Memory(format!(
                    "WriteProcessMemory({address:#x}, {} bytes) failed",
                    buf.len()
                )));
            }
            Ok(())
        }

        fn flush_icache(&self, address: u64, len: usize) -> Result<()> {
            let ok = unsafe { FlushInstructionCache(self.handle, address as *const _, len) };
            if ok == 0 {
                return Err(EngineError::Memory(format!(
                    "FlushInstructionCache({address:#x}, {len}) failed"
                )));
            }
            Ok(())
        }
    }

    impl WindowsProcessMemory {
        pub fn null() -> Self {
            WindowsProcessMemory { handle: null_mut() }
        }
    }
}

//! Target-Process Controller.
//!
//! Launches the target under the Win32 debug API, optionally inside a job object that
//! enforces a memory ceiling and CPU affinity, and optionally with stdio redirected to
//! the null device. `CreateProcess` must be called directly (not via `std::process::Command`)
//! because the debug flags and the inherited-handle startup info need to be set together
//! for the debugger to see every event starting from process creation.

use std::ffi::CString;

use bitflags::bitflags;

use crate::error::{EngineError, Result};

bitflags! {
    /// Which of a launch's optional resource controls are active, for a single
    /// compact debug-log line instead of three separate `Option` checks at every
    /// call site.
    #[derive(Default)]
    pub struct LaunchCaps: u8 {
        const MEM_LIMIT     = 0b001;
        const CPU_AFFINITY  = 0b010;
        const STDIO_SINKHOLE = 0b100;
    }
}

impl LaunchCaps {
    pub fn of(opts: &LaunchOptions) -> Self {
        let mut caps = LaunchCaps::empty();
        caps.set(LaunchCaps::MEM_LIMIT, opts.mem_limit_mb.is_some());
        caps.set(LaunchCaps::CPU_AFFINITY, opts.cpu_affinity_mask.is_some());
        caps.set(LaunchCaps::STDIO_SINKHOLE, opts.sinkhole_stdio);
        caps
    }
}

#[derive(Clone, Debug)]
pub struct LaunchedProcess {
    pub process_id: u32,
    pub main_thread_id: u32,
    pub is_wow64: bool,
}

/// Launches a debuggee, a capability so the event-loop state machine can be driven
/// against a fake process in tests without a real Win32 `CreateProcess` call.
pub trait ProcessLauncher {
    fn launch(&self, command_line: &str, opts: &LaunchOptions) -> Result<LaunchedProcess>;
    fn terminate(&self, process_id: u32) -> Result<()>;
}

#[derive(Clone, Debug, Default)]
pub struct LaunchOptions {
    pub mem_limit_mb: Option<u64>,
    pub cpu_affinity_mask: Option<u64>,
    pub sinkhole_stdio: bool,
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use std::mem::{size_of, zeroed};
    use std::ptr::null_mut;
    use winapi::shared::minwindef::{DWORD, FALSE, TRUE};
    use winapi::um::fileapi::{CreateFileA, OPEN_EXISTING};
    use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
    use winapi::um::jobapi2::{AssignProcessToJobObject, CreateJobObjectA, SetInformationJobObject};
    use winapi::um::processthreadsapi::{
        CreateProcessA, ResumeThread, TerminateProcess, PROCESS_INFORMATION, STARTUPINFOA,
    };
    use winapi::um::winbase::{
        CREATE_SUSPENDED, DEBUG_ONLY_THIS_PROCESS, DEBUG_PROCESS, JobObjectExtendedLimitInformation,
        STARTF_USESTDHANDLES,
    };
    use winapi::um::winnt::{
        GENERIC_READ, GENERIC_WRITE, HANDLE, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
        JOB_OBJECT_LIMIT_AFFINITY, JOB_OBJECT_LIMIT_PROCESS_MEMORY, PROCESS_ALL_ACCESS,
    };
    use winapi::um::wow64apiset::IsWow64Process;

    pub struct WindowsProcessLauncher;

    impl WindowsProcessLauncher {
        fn open_null_device(&self) -> Result<HANDLE> {
            let path = CString::new("NUL").unwrap();
            let handle = unsafe {
                CreateFileA(
                    path.as_ptr(),
                    GENERIC_READ | GENERIC_WRITE,
                    0,
                    null_mut(),
                    OPEN_EXISTING,
                    0,
                    null_mut(),
                )
            };
            if handle == INVALID_HANDLE_VALUE {
                return Err(EngineError::Launch("could not open NUL for stdio sinkhole".into()));
            }
            Ok(handle)
        }

        fn make_job_object(&self, opts: &LaunchOptions) -> Result<Option<HANDLE>> {
            if opts.mem_limit_mb.is_none() && opts.cpu_affinity_mask.is_none() {
                return Ok(None);
            }

            let job = unsafe { CreateJobObjectA(null_mut(), null_mut()) };
            if job.is_null() {
                return Err(EngineError::Launch("CreateJobObjectA failed".into()));
            }

            let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { zeroed() };
            if let Some(mb) = opts.mem_limit_mb {
                limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_PROCESS_MEMORY;
                limits.ProcessMemoryLimit = (mb * 1024 * 1024) as usize;
            }
            if let Some(mask) = opts.cpu_affinity_mask {
                limits.BasicLimitInformation.LimitFlags |= JOB_OBJECT_LIMIT_AFFINITY;
                limits.BasicLimitInformation.Affinity = mask as usize;
            }

            let ok = unsafe {
                SetInformationJobObject(
                    job,
                    JobObjectExtendedLimitInformation,
                    &mut limits as *mut _ as *mut _,
                    size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
                )
            };
            if ok == 0 {
                unsafe { CloseHandle(job) };
                return Err(EngineError::Launch("SetInformationJobObject failed".into()));
            }

            Ok(Some(job))
        }
    }

    impl ProcessLauncher for WindowsProcessLauncher {
        fn launch(&self, command_line: &str, opts: &LaunchOptions) -> Result<LaunchedProcess> {
            log::debug!("launching {command_line:?} with caps {:?}", LaunchCaps::of(opts));
            let job = self.make_job_object(opts)?;

            let mut startup_info: STARTUPINFOA = unsafe { zeroed() };
            startup_info.cb = size_of::<STARTUPINFOA>() as DWORD;

            let null_handle = if opts.sinkhole_stdio {
                let h = self.open_null_device()?;
                startup_info.dwFlags |= STARTF_USESTDHANDLES;
                startup_info.hStdOutput = h;
                startup_info.hStdError = h;
                Some(h)
            } else {
                None
            };

            let mut process_info: PROCESS_INFORMATION = unsafe { zeroed() };
            let mut cmdline = CString::new(command_line)
                .map_err(|_| EngineError::Launch("command line contains an embedded NUL".into()))?
                .into_bytes_with_nul();

            let creation_flags = DEBUG_PROCESS | DEBUG_ONLY_THIS_PROCESS | CREATE_SUSPENDED;
            let ok = unsafe {
                CreateProcessA(
                    null_mut(),
                    cmdline.as_mut_ptr() as *mut i8,
                    null_mut(),
                    null_mut(),
                    if opts.sinkhole_stdio { TRUE } else { FALSE },
                    creation_flags,
                    null_mut(),
                    null_mut(),
                    &mut startup_info,
                    &mut process_info,
                )
            };

            if let Some(h) = null_handle {
                unsafe { CloseHandle(h) };
            }

            if ok == 0 {
                if let Some(job) = job {
                    unsafe { CloseHandle(job) };
                }
                return Err(EngineError::Launch(format!(
                    "CreateProcessA({command_line:?}) failed"
                )));
            }

            if let Some(job) = job {
                let assigned = unsafe { AssignProcessToJobObject(job, process_info.hProcess) };
                if assigned == 0 {
                    unsafe {
                        TerminateProcess(process_info.hProcess, 1);
                        CloseHandle(process_info.hProcess);
                        CloseHandle(process_info.hThread);
                        CloseHandle(job);
                    }
                    return Err(EngineError::Launch("AssignProcessToJobObject failed".into()));
                }
            }

            let is_wow64 = self_is_wow64_mismatch(process_info.hProcess)?;

            unsafe { ResumeThread(process_info.hThread) };

            let result = LaunchedProcess {
                process_id: process_info.dwProcessId,
                main_thread_id: process_info.dwThreadId,
                is_wow64,
            };

            unsafe {
                CloseHandle(process_info.hProcess);
                CloseHandle(process_info.hThread);
            }

            Ok(result)
        }

        fn terminate(&self, process_id: u32) -> Result<()> {
            let handle = unsafe {
                winapi::um::processthreadsapi::OpenProcess(PROCESS_ALL_ACCESS, 0, process_id)
            };
            if handle.is_null() {
                return Ok(());
            }
            unsafe {
                TerminateProcess(handle, 1);
                CloseHandle(handle);
            }
            Ok(())
        }
    }

    /// Checks the launched process's bitness against ours.
    fn self_is_wow64_mismatch(process_handle: HANDLE) -> Result<bool> {
        let mut target_is_wow64: i32 = 0;
        let ok = unsafe { IsWow64Process(process_handle, &mut target_is_wow64) };
        if ok == 0 {
            return Err(EngineError::Launch("IsWow64Process(target) failed".into()));
        }

        let mut self_is_wow64: i32 = 0;
        let ok = unsafe {
            IsWow64Process(winapi::um::processthreadsapi::GetCurrentProcess(), &mut self_is_wow64)
        };
        if ok == 0 {
            return Err(EngineError::Launch("IsWow64Process(self) failed".into()));
        }

        if (target_is_wow64 != 0) != (self_is_wow64 != 0) {
            return Err(EngineError::BitnessMismatch);
        }

        Ok(target_is_wow64 != 0)
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct ScriptedProcessLauncher {
        pub launched: RefCell<Vec<(String, LaunchOptions)>>,
        pub terminated: RefCell<Vec<u32>>,
        pub next_process_id: std::cell::Cell<u32>,
    }

    impl ScriptedProcessLauncher {
        pub fn new(first_pid: u32) -> Self {
            ScriptedProcessLauncher {
                next_process_id: std::cell::Cell::new(first_pid),
                ..Default::default()
            }
        }
    }

    impl ProcessLauncher for ScriptedProcessLauncher {
        fn launch(&self, command_line: &str, opts: &LaunchOptions) -> Result<LaunchedProcess> {
            self.launched.borrow_mut().push((command_line.to_string(), opts.clone()));
            let pid = self.next_process_id.get();
            self.next_process_id.set(pid + 1);
            Ok(LaunchedProcess {
                process_id: pid,
                main_thread_id: pid + 1,
                is_wow64: false,
            })
        }

        fn terminate(&self, process_id: u32) -> Result<()> {
            self.terminated.borrow_mut().push(process_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedProcessLauncher;
    use super::*;

    #[test]
    fn launch_caps_reflects_which_options_are_set() {
        let caps = LaunchCaps::of(&LaunchOptions { mem_limit_mb: Some(64), ..Default::default() });
        assert!(caps.contains(LaunchCaps::MEM_LIMIT));
        assert!(!caps.contains(LaunchCaps::CPU_AFFINITY));
        assert!(!caps.contains(LaunchCaps::STDIO_SINKHOLE));
    }

    #[test]
    fn scripted_launcher_assigns_increasing_process_ids() {
        let launcher = ScriptedProcessLauncher::new(100);
        let opts = LaunchOptions::default();
        let a = launcher.launch("target.exe", &opts).unwrap();
        let b = launcher.launch("target.exe", &opts).unwrap();
        assert_eq!(a.process_id, 100);
        assert_eq!(b.process_id, 101);
    }

    #[test]
    fn scripted_launcher_records_launch_options() {
        let launcher = ScriptedProcessLauncher::new(1);
        let opts = LaunchOptions {
            mem_limit_mb: Some(256),
            cpu_affinity_mask: Some(0b0011),
            sinkhole_stdio: true,
        };
        launcher.launch("target.exe -seed a", &opts).unwrap();
        let recorded = launcher.launched.borrow();
        assert_eq!(recorded[0].0, "target.exe -seed a");
        assert_eq!(recorded[0].1.mem_limit_mb, Some(256));
    }
}

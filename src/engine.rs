//! Top-level persistent-mode fuzzing engine, wiring every capability
//! together. This replaces a single set of process-wide global statics
//! (`child_handle`, `breakpoints`, `options`, ...) with one explicitly owned `Engine`
//! value so more than one could, in
//! principle, exist in a process at once — useful for the tests below, which build
//! several independent engines against scripted capabilities.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::breakpoint::{BreakpointKind, BreakpointManager, Hit};
use crate::config::{CallConv, Config, CoverageKind};
use crate::error::{EngineError, Result};
use crate::mem::ProcessMemory;
use crate::module::{LoadedModule, ModuleEnumerator, ModuleTable, SymbolResolver};
use crate::process::{LaunchOptions, LaunchedProcess, ProcessLauncher};
use crate::registers::Arch;
use crate::thread::{capture_on_first_entry, restore_for_next_iteration, IterationSnapshot, ThreadContext};
use crate::trace::coverage::CoverageMap;
use crate::trace::packet::{for_each_tip, resolve_ip};
use crate::trace::ring::{RingDrainer, TraceAccumulator};
use crate::trace::IptTraceSource;

/// The sentinel return address planted under the fuzz method's real return address.
pub const SENTINEL_RETURN_ADDRESS: u64 = 0x0AF1;

const MAX_TRACE_BYTES: usize = 64 * 1024 * 1024;

/// Exception codes that unconditionally end an iteration as a crash. A closed list,
/// matching the `case` labels the original debug-event switch falls into before its
/// `default:` (which reports the exception unhandled and keeps running). Everything
/// not on this list — a guard-page access, a first-chance C++ exception, a
/// thread-naming exception, etc. — is reported unhandled and the loop continues.
const EXCEPTION_ILLEGAL_INSTRUCTION: u32 = 0xC000_001D;
const EXCEPTION_PRIV_INSTRUCTION: u32 = 0xC000_0096;
const EXCEPTION_INT_DIVIDE_BY_ZERO: u32 = 0xC000_0094;
const EXCEPTION_STACK_OVERFLOW: u32 = 0xC000_00FD;
const STATUS_HEAP_CORRUPTION: u32 = 0xC000_0374;
const STATUS_STACK_BUFFER_OVERRUN: u32 = 0xC000_0409;
const STATUS_FATAL_APP_EXIT: u32 = 0xC000_0602;

fn is_fatal_exception_code(code: u32) -> bool {
    matches!(
        code,
        EXCEPTION_ILLEGAL_INSTRUCTION
            | EXCEPTION_PRIV_INSTRUCTION
            | EXCEPTION_INT_DIVIDE_BY_ZERO
            | EXCEPTION_STACK_OVERFLOW
            | STATUS_HEAP_CORRUPTION
            | STATUS_STACK_BUFFER_OVERRUN
            | STATUS_FATAL_APP_EXIT
    )
}

/// Module size to assume when a module is seen for the first time through an event
/// that doesn't carry its true size (the synthetic `LoadedModule` built for an
/// `entrypoint`/`module-loaded` breakpoint). Large enough to cover a header plus a
/// typical export directory; `resolve_target_address`'s remote read is clamped to
/// whatever the process actually has mapped, so an over-estimate here is harmless.
const ASSUMED_MODULE_PEEK_LEN: u64 = 0x10_0000;

/// Outcome of a single fuzzing iteration, reported to the fuzzer driver.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum FaultCode {
    /// The target method ran to completion with no crash.
    None,
    /// The target (or the whole process) did not finish within its deadline.
    Timeout,
    /// An exception other than the sentinel access violation was observed.
    Crash,
    /// The process exited, or another unrecoverable debugger error occurred.
    Error,
    /// Tracing completed but produced no decodable packets (IPT unavailable or the
    /// hardware buffer never filled).
    NoInst,
    /// Packets decoded, but none folded any bit into the coverage map.
    NoBits,
}

/// A single Win32 debug event, reduced to the fields the engine dispatches on.
#[derive(Clone, Debug)]
pub enum DebugEvent {
    Breakpoint { thread_id: u32, address: u64 },
    AccessViolation { thread_id: u32, address: u64 },
    OtherException { thread_id: u32, code: u32 },
    CreateProcess { thread_id: u32, base_of_image: u64 },
    LoadDll { thread_id: u32, base_of_image: u64, file_path: Option<String> },
    ExitProcess { exit_code: u32 },
    ExitThread,
    Other,
}

/// Delivers debug events and lets the engine resolve them, a capability so the event
/// loop's state machine can be driven by a scripted sequence in tests instead of
/// `WaitForDebugEvent`/`ContinueDebugEvent`.
pub trait DebugEventSource {
    /// Waits up to `timeout_ms` for the next event. `Ok(None)` means the wait timed
    /// out with nothing pending.
    fn wait(&self, timeout_ms: u32) -> Result<Option<DebugEvent>>;
    fn continue_event(&self, thread_id: u32, exception_handled: bool) -> Result<()>;
}

enum LoopOutcome {
    FuzzMethodReached,
    FuzzMethodEnd,
    Crashed,
    ProcessExited,
    TimedOut,
}

/// Ties every capability and every piece of persistent state together for one
/// debuggee.
pub struct Engine {
    config: Config,
    launcher: Box<dyn ProcessLauncher>,
    mem: Box<dyn ProcessMemory>,
    threads: Box<dyn ThreadContext>,
    events: Box<dyn DebugEventSource>,
    trace_source: Box<dyn IptTraceSource>,
    modules: Box<dyn ModuleEnumerator>,
    symbols: Box<dyn SymbolResolver>,
    arch: Arch,

    coverage_module_names: Vec<String>,
    breakpoints: BreakpointManager,
    module_table: ModuleTable,
    process: Option<LaunchedProcess>,
    entrypoint_reached: bool,
    snapshot: Option<IterationSnapshot>,
    coverage: CoverageMap,
    iterations_run: u32,

    ring_drainer: RingDrainer,
    trace_accumulator: Option<TraceAccumulator>,

    /// A debug event whose exception has already been handled (breakpoint restored,
    /// context spliced) but whose `ContinueDebugEvent` call is deliberately withheld:
    /// the fuzz-method-entry hit and the sentinel-return hit both land here so the
    /// traced thread only actually resumes once tracing for the iteration it is about
    /// to run has been started (§4.5: tracing is armed "immediately before resuming
    /// the traced process for an iteration", not after).
    pending_continue: Option<u32>,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        launcher: Box<dyn ProcessLauncher>,
        mem: Box<dyn ProcessMemory>,
        threads: Box<dyn ThreadContext>,
        events: Box<dyn DebugEventSource>,
        trace_source: Box<dyn IptTraceSource>,
        modules: Box<dyn ModuleEnumerator>,
        symbols: Box<dyn SymbolResolver>,
        arch: Arch,
    ) -> Self {
        let coverage_module_names: Vec<String> = config
            .coverage_modules
            .iter()
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect();

        Engine {
            config,
            launcher,
            mem,
            threads,
            events,
            trace_source,
            modules,
            symbols,
            arch,
            module_table: ModuleTable::new(coverage_module_names.clone()),
            coverage_module_names,
            breakpoints: BreakpointManager::new(),
            process: None,
            entrypoint_reached: false,
            snapshot: None,
            coverage: CoverageMap::new(),
            iterations_run: 0,
            ring_drainer: RingDrainer::new(),
            trace_accumulator: None,
            pending_continue: None,
        }
    }

    pub fn coverage(&self) -> &CoverageMap {
        &self.coverage
    }

    /// Runs one fuzzing iteration against `child_argv`, launching the target on the
    /// first call and persisting it across every subsequent call. `timeout_ms`
    /// bounds both the entry phase (first call only) and the traced call itself.
    pub fn run_iteration(&mut self, child_argv: &str, timeout_ms: u32) -> Result<FaultCode> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);

        if self.process.is_none() {
            self.launch(child_argv)?;
            match self.debug_loop(deadline, false)? {
                LoopOutcome::FuzzMethodReached => {}
                LoopOutcome::TimedOut => return Ok(FaultCode::Timeout),
                LoopOutcome::ProcessExited | LoopOutcome::Crashed | LoopOutcome::FuzzMethodEnd => {
                    return Err(EngineError::PreEntryTermination);
                }
            }
        } else {
            self.resume_for_next_iteration()?;
        }

        self.coverage = CoverageMap::new();
        self.ring_drainer.reset();
        self.trace_accumulator = Some(TraceAccumulator::new(MAX_TRACE_BYTES));
        self.trace_source.start()?;
        self.release_pending_continue()?;

        let outcome = self.debug_loop(deadline, true);
        let _ = self.trace_source.stop();
        let accumulated = self.trace_accumulator.take().unwrap_or_else(|| TraceAccumulator::new(0));

        let fault = match outcome? {
            LoopOutcome::FuzzMethodEnd => {
                let decoded = self.fold_trace(accumulated.bytes())?;
                self.iterations_run += 1;

                let fault = if decoded == 0 {
                    FaultCode::NoInst
                } else if self.coverage.hit_count() == 0 {
                    FaultCode::NoBits
                } else {
                    FaultCode::None
                };
                debug!("iteration {} finished: {fault:?}, {decoded} packets decoded", self.iterations_run);
                fault
            }
            LoopOutcome::TimedOut => {
                self.teardown_process();
                FaultCode::Timeout
            }
            LoopOutcome::Crashed => {
                self.teardown_process();
                FaultCode::Crash
            }
            LoopOutcome::ProcessExited => {
                self.teardown_process();
                FaultCode::Error
            }
            LoopOutcome::FuzzMethodReached => {
                // The event loop never returns this once tracing is active; see
                // `debug_loop`'s dispatch of `BreakpointKind::FuzzMethod`.
                unreachable!("fuzz-method breakpoint cannot fire twice without a restore in between")
            }
        };

        if matches!(fault, FaultCode::None | FaultCode::NoInst | FaultCode::NoBits)
            && self.iterations_run >= self.config.fuzz_iterations
        {
            debug!("fuzz_iterations cap ({}) reached, relaunching next call", self.config.fuzz_iterations);
            self.teardown_process();
        }

        Ok(fault)
    }

    fn launch(&mut self, child_argv: &str) -> Result<()> {
        let opts = LaunchOptions {
            mem_limit_mb: self.config.mem_limit_mb,
            cpu_affinity_mask: self.config.cpu_affinity_mask,
            sinkhole_stdio: self.config.sinkhole_stdio,
        };
        let launched = self.launcher.launch(child_argv, &opts)?;
        self.process = Some(launched);
        Ok(())
    }

    /// Kills and reaps the traced process, then resets every piece of per-process
    /// state so the next `run_iteration` call relaunches from scratch.
    fn teardown_process(&mut self) {
        if let Some(process) = self.process.take() {
            let _ = self.launcher.terminate(process.process_id);
            self.reap_residual_events();
        }
        self.entrypoint_reached = false;
        self.snapshot = None;
        self.breakpoints = BreakpointManager::new();
        self.module_table = ModuleTable::new(self.coverage_module_names.clone());
        self.iterations_run = 0;
        self.trace_accumulator = None;
        self.ring_drainer.reset();
        self.pending_continue = None;
    }

    /// Lets a debug event handled earlier in this call (fuzz-method entry or
    /// sentinel-return) actually resume the traced thread, now that tracing for the
    /// iteration it is about to run is active.
    fn release_pending_continue(&mut self) -> Result<()> {
        if let Some(thread_id) = self.pending_continue.take() {
            self.events.continue_event(thread_id, true)?;
        }
        Ok(())
    }

    /// Pumps debug events until the exit-process event is observed or the stream
    /// goes quiet, so the OS debug port for the terminated process is drained rather
    /// than left pending.
    fn reap_residual_events(&self) {
        let reap_deadline = Instant::now() + Duration::from_millis(2_000);
        while Instant::now() < reap_deadline {
            match self.events.wait(50) {
                Ok(Some(DebugEvent::ExitProcess { .. })) | Ok(None) => return,
                Ok(Some(_)) => {
                    let _ = self.events.continue_event(0, false);
                }
                Err(_) => return,
            }
        }
    }

    fn resume_for_next_iteration(&mut self) -> Result<()> {
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| EngineError::Config("no iteration snapshot to resume from".into()))?;
        restore_for_next_iteration(
            self.threads.as_ref(),
            self.mem.as_ref(),
            &snapshot,
            self.config.callconv,
            self.arch,
        )
    }

    /// Drives the debug-event loop until an outcome worth reporting to `run_iteration`
    /// occurs. `tracing_active` mirrors 's "0 ms wait when a trace drain is
    /// active" and 's "on every iteration of the loop, also drain a ring-buffer
    /// snapshot" — both only apply once tracing has started for this call.
    fn debug_loop(&mut self, deadline: Instant, tracing_active: bool) -> Result<LoopOutcome> {
        loop {
            if Instant::now() >= deadline {
                return Ok(LoopOutcome::TimedOut);
            }

            if tracing_active {
                self.drain_trace_tick()?;
            }

            let wait_ms = if tracing_active { 0 } else { 100 };
            let event = match self.events.wait(wait_ms)? {
                Some(e) => e,
                None => continue,
            };

            match event {
                DebugEvent::Breakpoint { thread_id, address } => {
                    let hit = {
                        let threads = self.threads.as_ref();
                        self.breakpoints.handle(self.mem.as_ref(), address, || {
                            let mut regs = threads.get_context(thread_id)?;
                            regs.ip -= 1;
                            threads.set_context(thread_id, &regs)
                        })?
                    };
                    match hit {
                        Hit::Unknown => {
                            self.events.continue_event(thread_id, false)?;
                        }
                        Hit::Known(record) => match record.kind {
                            BreakpointKind::Entrypoint => {
                                self.on_entrypoint()?;
                                self.events.continue_event(thread_id, true)?;
                            }
                            BreakpointKind::ModuleLoaded => {
                                if let (Some(name), Some(base)) = (record.module_name, record.module_base) {
                                    self.arm_fuzz_method_by_name(name, base)?;
                                }
                                self.events.continue_event(thread_id, true)?;
                            }
                            BreakpointKind::FuzzMethod => {
                                self.on_target_method(thread_id)?;
                                // Continue is withheld until tracing starts; see
                                // `pending_continue`.
                                self.pending_continue = Some(thread_id);
                                return Ok(LoopOutcome::FuzzMethodReached);
                            }
                        },
                    }
                }
                DebugEvent::AccessViolation { thread_id, address } => {
                    if address == SENTINEL_RETURN_ADDRESS {
                        self.on_target_method_ended(thread_id)?;
                        // Likewise withheld until the next iteration's tracing starts.
                        self.pending_continue = Some(thread_id);
                        return Ok(LoopOutcome::FuzzMethodEnd);
                    }
                    self.events.continue_event(thread_id, false)?;
                    return Ok(LoopOutcome::Crashed);
                }
                DebugEvent::OtherException { thread_id, code } => {
                    self.events.continue_event(thread_id, false)?;
                    if is_fatal_exception_code(code) {
                        warn!("exception {code:#x} on thread {thread_id}, treating as a crash");
                        return Ok(LoopOutcome::Crashed);
                    }
                    debug!("unhandled exception {code:#x} on thread {thread_id}, continuing");
                }
                DebugEvent::CreateProcess { thread_id, base_of_image } => {
                    self.arm_entrypoint_breakpoint(base_of_image)?;
                    self.events.continue_event(thread_id, true)?;
                }
                DebugEvent::LoadDll { thread_id, base_of_image, file_path } => {
                    if self.entrypoint_reached {
                        self.on_dll_loaded(base_of_image, file_path.as_deref())?;
                    }
                    self.events.continue_event(thread_id, true)?;
                }
                DebugEvent::ExitProcess { .. } => return Ok(LoopOutcome::ProcessExited),
                DebugEvent::ExitThread | DebugEvent::Other => {}
            }
        }
    }

    /// Enumerates every module already mapped by the time the process entrypoint
    /// runs. Modules loaded
    /// later arrive through `LOAD_DLL_DEBUG_EVENT` instead.
    fn on_entrypoint(&mut self) -> Result<()> {
        self.entrypoint_reached = true;
        let modules = self.modules.list_modules()?;
        for module in modules {
            debug!("module loaded at entrypoint: {} @ {:#x}", module.name, module.base);
            self.register_module(module)?;
        }
        Ok(())
    }

    fn arm_entrypoint_breakpoint(&mut self, base_of_image: u64) -> Result<()> {
        let module = LoadedModule { name: String::new(), base: base_of_image, size: 0x1000, path: None };
        let entry = crate::module::resolve_entrypoint(self.mem.as_ref(), &module)?;
        self.breakpoints
            .install(self.mem.as_ref(), entry, BreakpointKind::Entrypoint, None, None)
    }

    /// A module loaded after the entrypoint is not yet finished initializing; rather
    /// than reading its exports immediately, a breakpoint is set at *its* entrypoint
    /// first.
    fn on_dll_loaded(&mut self, base_of_image: u64, file_path: Option<&str>) -> Result<()> {
        let name = file_path
            .and_then(|p| p.rsplit(['\\', '/']).next())
            .unwrap_or("")
            .to_string();

        if self.config.target_module.as_deref().map(|m| m.eq_ignore_ascii_case(&name)).unwrap_or(false) {
            debug!("target module {name} late-loaded at {base_of_image:#x}, arming its entrypoint");
            let module = LoadedModule { name: name.clone(), base: base_of_image, size: 0x1000, path: None };
            let entry = crate::module::resolve_entrypoint(self.mem.as_ref(), &module)?;
            self.breakpoints.install(
                self.mem.as_ref(),
                entry,
                BreakpointKind::ModuleLoaded,
                Some(name),
                Some(base_of_image),
            )?;
        }
        Ok(())
    }

    fn register_module(&mut self, module: LoadedModule) -> Result<()> {
        let name = module.name.clone();
        let of_interest_target = self
            .config
            .target_module
            .as_deref()
            .map(|m| m.eq_ignore_ascii_case(&name))
            .unwrap_or(false);
        self.module_table.on_module_loaded(module.clone());

        if of_interest_target {
            self.arm_fuzz_method(module)?;
        }
        Ok(())
    }

    /// Resolves and breakpoints the fuzz method once its module is fully loaded,
    /// when the module's true size is already known (the initial-enumeration path).
    fn arm_fuzz_method(&mut self, module: LoadedModule) -> Result<()> {
        let address = crate::module::resolve_target_address(
            self.mem.as_ref(),
            self.symbols.as_ref(),
            &module,
            self.config.target_method.as_deref(),
            self.config.target_offset,
        )?;
        self.breakpoints.install(self.mem.as_ref(), address, BreakpointKind::FuzzMethod, None, None)
    }

    /// Same as `arm_fuzz_method`, but for the late-loaded-module path, where
    /// the only thing the `module-loaded` breakpoint record carries is a name and a
    /// base address. The module's true size is looked up fresh, since by now (its own
    /// entrypoint has run) the loader has finished relocating and importing it.
    fn arm_fuzz_method_by_name(&mut self, module_name: String, module_base: u64) -> Result<()> {
        let size = self
            .modules
            .list_modules()?
            .into_iter()
            .find(|m| m.name.eq_ignore_ascii_case(&module_name))
            .map(|m| m.size)
            .unwrap_or(ASSUMED_MODULE_PEEK_LEN);
        self.arm_fuzz_method(LoadedModule { name: module_name, base: module_base, size, path: None })
    }

    fn on_target_method(&mut self, thread_id: u32) -> Result<()> {
        let regs = self.threads.get_context(thread_id)?;
        let snapshot = capture_on_first_entry(
            self.threads.as_ref(),
            self.mem.as_ref(),
            thread_id,
            regs.ip,
            self.config.callconv,
            self.arch,
            self.config.num_args,
            SENTINEL_RETURN_ADDRESS,
        )?;
        self.snapshot = Some(snapshot);
        Ok(())
    }

    fn on_target_method_ended(&mut self, _thread_id: u32) -> Result<()> {
        let snapshot = self
            .snapshot
            .clone()
            .ok_or_else(|| EngineError::Config("target method ended with no snapshot captured".into()))?;
        restore_for_next_iteration(
            self.threads.as_ref(),
            self.mem.as_ref(),
            &snapshot,
            self.config.callconv,
            self.arch,
        )
    }

    /// One ring-buffer drain tick: polls every traced thread's
    /// current ring state and folds the fuzz thread's new bytes into the iteration's
    /// accumulator.
    fn drain_trace_tick(&mut self) -> Result<()> {
        let thread_id = match self.snapshot.as_ref() {
            Some(s) => s.fuzz_thread_id,
            None => return Ok(()),
        };
        let headers = self.trace_source.poll()?;
        if let Some(accumulator) = self.trace_accumulator.as_mut() {
            let was_full = accumulator.is_full();
            self.ring_drainer.drain(&headers, thread_id, accumulator);
            if !was_full && accumulator.is_full() {
                warn!("trace buffer reached its {MAX_TRACE_BYTES}-byte cap; further bytes are dropped");
            }
        }
        Ok(())
    }

    fn fold_trace(&mut self, trace: &[u8]) -> Result<usize> {
        let mut decoded = 0usize;
        let kind = self.config.coverage_kind;
        let coverage = &mut self.coverage;
        for_each_tip(trace, |ip, compression| {
            if let Some(resolved) = resolve_ip(ip, compression) {
                coverage.record(kind, resolved);
                decoded += 1;
            }
        })?;
        Ok(decoded)
    }
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use std::cell::Cell;
    use std::mem::zeroed;
    use winapi::um::debugapi::{ContinueDebugEvent, WaitForDebugEvent};
    use winapi::um::minwinbase::{
        CREATE_PROCESS_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT,
        EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT,
    };
    use winapi::um::winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, EXCEPTION_ACCESS_VIOLATION, EXCEPTION_BREAKPOINT};

    /// `ContinueDebugEvent` needs the process id of the event being continued, which
    /// the engine's `DebugEventSource` trait doesn't carry through; the last-seen
    /// process id from `wait` is cached here instead.
    #[derive(Default)]
    pub struct WindowsDebugEventSource {
        last_process_id: Cell<u32>,
    }

    impl WindowsDebugEventSource {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl DebugEventSource for WindowsDebugEventSource {
        fn wait(&self, timeout_ms: u32) -> Result<Option<DebugEvent>> {
            let mut raw: DEBUG_EVENT = unsafe { zeroed() };
            let got = unsafe { WaitForDebugEvent(&mut raw, timeout_ms) };
            if got == 0 {
                return Ok(None);
            }
            self.last_process_id.set(raw.dwProcessId);

            let event = match raw.dwDebugEventCode {
                EXCEPTION_DEBUG_EVENT => unsafe {
                    let record = raw.u.Exception().ExceptionRecord;
                    let address = record.ExceptionAddress as u64;
                    match record.ExceptionCode {
                        EXCEPTION_BREAKPOINT => DebugEvent::Breakpoint { thread_id: raw.dwThreadId, address },
                        EXCEPTION_ACCESS_VIOLATION => {
                            DebugEvent::AccessViolation { thread_id: raw.dwThreadId, address }
                        }
                        code => DebugEvent::OtherException { thread_id: raw.dwThreadId, code },
                    }
                },
                CREATE_PROCESS_DEBUG_EVENT => unsafe {
                    let info = raw.u.CreateProcessInfo();
                    DebugEvent::CreateProcess {
                        thread_id: raw.dwThreadId,
                        base_of_image: info.lpBaseOfImage as u64,
                    }
                },
                LOAD_DLL_DEBUG_EVENT => unsafe {
                    let info = raw.u.LoadDll();
                    DebugEvent::LoadDll {
                        thread_id: raw.dwThreadId,
                        base_of_image: info.lpBaseOfDll as u64,
                        file_path: None,
                    }
                },
                EXIT_PROCESS_DEBUG_EVENT => unsafe {
                    let info = raw.u.ExitProcess();
                    DebugEvent::ExitProcess { exit_code: info.dwExitCode }
                },
                EXIT_THREAD_DEBUG_EVENT => DebugEvent::ExitThread,
                _ => DebugEvent::Other,
            };

            Ok(Some(event))
        }

        fn continue_event(&self, thread_id: u32, exception_handled: bool) -> Result<()> {
            let status = if exception_handled { DBG_CONTINUE } else { DBG_EXCEPTION_NOT_HANDLED };
            unsafe { ContinueDebugEvent(self.last_process_id.get(), thread_id, status as u32) };
            Ok(())
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct ScriptedDebugEventSource {
        queue: RefCell<Vec<DebugEvent>>,
        pub continued: RefCell<Vec<(u32, bool)>>,
    }

    impl ScriptedDebugEventSource {
        pub fn new(events: Vec<DebugEvent>) -> Self {
            ScriptedDebugEventSource { queue: RefCell::new(events), continued: RefCell::new(Vec::new()) }
        }
    }

    impl DebugEventSource for ScriptedDebugEventSource {
        fn wait(&self, _timeout_ms: u32) -> Result<Option<DebugEvent>> {
            let mut queue = self.queue.borrow_mut();
            if queue.is_empty() {
                return Ok(None);
            }
            Ok(Some(queue.remove(0)))
        }

        fn continue_event(&self, thread_id: u32, exception_handled: bool) -> Result<()> {
            self.continued.borrow_mut().push((thread_id, exception_handled));
            Ok(())
        }
    }
}

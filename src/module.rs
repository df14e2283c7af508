//! Module & Symbol Resolver.
//!
//! Resolves a target method's absolute address from `-target_module` plus either
//! `-target_method` or `-target_offset`, and keeps the set of modules the coverage
//! bitmap should fold trace packets against (`-coverage_module`, possibly late-loaded).

use std::collections::HashMap;

use crate::error::{EngineError, Result};
use crate::mem::ProcessMemory;
use crate::pe;

const HEADER_PEEK_LEN: usize = 4096;

#[derive(Clone, Debug, Default)]
pub struct LoadedModule {
    pub name: String,
    pub base: u64,
    pub size: u64,
    /// On-disk path, when known. Populated by the live enumerator; absent from
    /// synthetic modules built during the entrypoint/load-DLL handling, where only
    /// the base address is known yet. Needed by the debug-symbol fallback, which
    /// loads the module by path rather than by remote image.
    pub path: Option<String>,
}

/// Third and last resolution strategy: debug-symbol lookup against the module image
/// on disk, abstracted as a capability so it can be exercised without `dbghelp.dll`.
/// `resolve` returns `Ok(None)` when the symbol genuinely isn't found (the caller then
/// reports `EngineError::SymbolResolution`); it returns `Err` only for an OS-call
/// failure distinct from "symbol absent".
pub trait SymbolResolver {
    fn resolve(&self, module: &LoadedModule, method: &str) -> Result<Option<u64>>;
}

/// The no-op resolver: strategy 3 is skipped. Used whenever `dbghelp` isn't available
/// (non-Windows builds, or tests that only exercise strategies 1-2).
#[derive(Default)]
pub struct NullSymbolResolver;

impl SymbolResolver for NullSymbolResolver {
    fn resolve(&self, _module: &LoadedModule, _method: &str) -> Result<Option<u64>> {
        Ok(None)
    }
}

/// Enumerates the modules mapped into the traced process, a capability so module
/// discovery (including the late-loaded-DLL case) can be driven by a scripted fake
/// in tests instead of `EnumProcessModules`/`psapi`.
pub trait ModuleEnumerator {
    fn list_modules(&self) -> Result<Vec<LoadedModule>>;
}

/// Tracks which modules are of interest for coverage folding and resolves the target
/// method's address the first time its module is seen loaded.
pub struct ModuleTable {
    coverage_module_names: Vec<String>,
    known: HashMap<String, LoadedModule>,
}

impl ModuleTable {
    pub fn new(coverage_module_names: Vec<String>) -> Self {
        ModuleTable {
            coverage_module_names,
            known: HashMap::new(),
        }
    }

    /// Called on every `CREATE_PROCESS_DEBUG_EVENT`/`LOAD_DLL_DEBUG_EVENT`.
    /// Returns `true` if this module is one the coverage bitmap should fold against.
    pub fn on_module_loaded(&mut self, module: LoadedModule) -> bool {
        let of_interest = self
            .coverage_module_names
            .iter()
            .any(|n| n.eq_ignore_ascii_case(&module.name));
        self.known.insert(module.name.clone(), module);
        of_interest
    }

    pub fn base_of(&self, name: &str) -> Option<u64> {
        self.known.get(name).map(|m| m.base)
    }

    pub fn is_coverage_module(&self, name: &str) -> bool {
        self.coverage_module_names.iter().any(|n| n.eq_ignore_ascii_case(name))
    }
}

/// Resolves the target method's absolute address once its module is loaded:
/// an explicit, *nonzero* `-target_offset` is used as-is (module base + offset);
/// zero is treated as unset, matching `config.rs`'s own offset-vs-method validation,
/// and falls through to the export table scan. Either way a single breakpoint
/// address comes out, to be armed by `crate::breakpoint`.
pub fn resolve_target_address(
    mem: &dyn ProcessMemory,
    symbols: &dyn SymbolResolver,
    module: &LoadedModule,
    method: Option<&str>,
    offset: Option<u64>,
) -> Result<u64> {
    if let Some(offset) = offset.filter(|&o| o != 0) {
        return Ok(module.base + offset);
    }

    let method = method.ok_or_else(|| EngineError::Config(
        "resolve_target_address requires either a method name or an offset".into(),
    ))?;

    let mut image = vec![0u8; module.size.min(usize::MAX as u64) as usize];
    mem.read(module.base, &mut image)?;

    if let Some(rva) = pe::export_rva(&image, method)? {
        return Ok(module.base + rva as u64);
    }

    if let Some(address) = symbols.resolve(module, method)? {
        return Ok(address);
    }

    Err(EngineError::SymbolResolution { module: module.name.clone(), method: method.to_string() })
}

/// Reads just the module's header page to resolve its entrypoint RVA.
pub fn resolve_entrypoint(mem: &dyn ProcessMemory, module: &LoadedModule) -> Result<u64> {
    let mut header = vec![0u8; HEADER_PEEK_LEN.min(module.size as usize).max(0x200)];
    mem.read(module.base, &mut header)?;
    let rva = pe::entrypoint_rva(&header)?;
    Ok(module.base + rva as u64)
}

/// Third and last strategy to resolve the target method's address: load the
/// module's own debug symbols and look the name up there, via the `dbghelp`-feature
/// exports bundled with `winapi`.
#[cfg(windows)]
pub fn resolve_via_debug_symbols(
    process_handle: *mut winapi::ctypes::c_void,
    module_base: u64,
    module_size: u32,
    module_path: &str,
    module_name: &str,
    method: &str,
) -> Result<u64> {
    use std::ffi::CString;
    use std::mem::size_of;
    use winapi::um::dbghelp::{SymCleanup, SymFromName, SymInitialize, SymLoadModuleExA, SYMBOL_INFO};

    const MAX_SYM_NAME: usize = 2000;
    let buf_len = size_of::<SYMBOL_INFO>() + MAX_SYM_NAME;
    let mut buffer = vec![0u8; buf_len];

    let path_c = CString::new(module_path).map_err(|_| {
        EngineError::SymbolResolution { module: module_name.to_string(), method: method.to_string() }
    })?;
    let name_c = CString::new(module_name).map_err(|_| {
        EngineError::SymbolResolution { module: module_name.to_string(), method: method.to_string() }
    })?;
    let method_c = CString::new(method).map_err(|_| {
        EngineError::SymbolResolution { module: module_name.to_string(), method: method.to_string() }
    })?;

    unsafe {
        SymInitialize(process_handle, std::ptr::null_mut(), 0);

        let loaded = SymLoadModuleExA(
            process_handle,
            std::ptr::null_mut(),
            path_c.as_ptr(),
            name_c.as_ptr(),
            module_base,
            module_size,
            std::ptr::null_mut(),
            0,
        );
        if loaded == 0 {
            SymCleanup(process_handle);
            return Err(EngineError::SymbolResolution {
                module: module_name.to_string(),
                method: method.to_string(),
            });
        }

        let symbol = buffer.as_mut_ptr() as *mut SYMBOL_INFO;
        (*symbol).SizeOfStruct = size_of::<SYMBOL_INFO>() as u32;
        (*symbol).MaxNameLen = MAX_SYM_NAME as u32;

        let found = SymFromName(process_handle, method_c.as_ptr(), symbol);
        let resolved = if found != 0 { Some((*symbol).Address) } else { None };
        SymCleanup(process_handle);

        resolved.ok_or_else(|| EngineError::SymbolResolution {
            module: module_name.to_string(),
            method: method.to_string(),
        })
    }
}

#[cfg(windows)]
pub mod win {
    use super::*;
    use std::ffi::CStr;
    use std::os::raw::c_char;
    use winapi::shared::minwindef::{DWORD, HMODULE, MAX_PATH};
    use winapi::um::psapi::{
        EnumProcessModulesEx, GetModuleBaseNameA, GetModuleFileNameExA, GetModuleInformation,
        LIST_MODULES_ALL, MODULEINFO,
    };
    use winapi::um::winnt::HANDLE;

    pub struct WindowsModuleEnumerator {
        pub process_handle: HANDLE,
    }

    unsafe impl Send for WindowsModuleEnumerator {}

    impl ModuleEnumerator for WindowsModuleEnumerator {
        fn list_modules(&self) -> Result<Vec<LoadedModule>> {
            const MAX_MODULES: usize = 1024;
            let mut handles: Vec<HMODULE> = vec![std::ptr::null_mut(); MAX_MODULES];
            let mut needed: DWORD = 0;

            let ok = unsafe {
                EnumProcessModulesEx(
                    self.process_handle,
                    handles.as_mut_ptr(),
                    (handles.len() * std::mem::size_of::<HMODULE>()) as DWORD,
                    &mut needed,
                    LIST_MODULES_ALL,
                )
            };
            if ok == 0 {
                return Err(EngineError::Memory("EnumProcessModulesEx failed".into()));
            }
            let count = (needed as usize / std::mem::size_of::<HMODULE>()).min(handles.len());

            let mut modules = Vec::with_capacity(count);
            for &handle in &handles[..count] {
                let mut name_buf = [0 as c_char; MAX_PATH];
                let len = unsafe {
                    GetModuleBaseNameA(
                        self.process_handle,
                        handle,
                        name_buf.as_mut_ptr(),
                        name_buf.len() as DWORD,
                    )
                };
                if len == 0 {
                    continue;
                }
                let name = unsafe { CStr::from_ptr(name_buf.as_ptr()) }
                    .to_string_lossy()
                    .into_owned();

                let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
                let ok = unsafe {
                    GetModuleInformation(
                        self.process_handle,
                        handle,
                        &mut info,
                        std::mem::size_of::<MODULEINFO>() as DWORD,
                    )
                };
                if ok == 0 {
                    continue;
                }

                let mut path_buf = [0 as c_char; MAX_PATH];
                let path_len = unsafe {
                    GetModuleFileNameExA(
                        self.process_handle,
                        handle,
                        path_buf.as_mut_ptr(),
                        path_buf.len() as DWORD,
                    )
                };
                let path = (path_len != 0).then(|| {
                    unsafe { CStr::from_ptr(path_buf.as_ptr()) }.to_string_lossy().into_owned()
                });

                modules.push(LoadedModule {
                    name,
                    base: info.lpBaseOfDll as u64,
                    size: info.SizeOfImage as u64,
                    path,
                });
            }

            Ok(modules)
        }
    }

    /// Debug-symbol resolution strategy as a `SymbolResolver`: loads the module's
    /// on-disk symbols through `dbghelp` and looks the method name up there. Requires
    /// `module.path`, which only the live enumerator populates.
    pub struct DebugSymbolResolver {
        pub process_handle: HANDLE,
    }

    unsafe impl Send for DebugSymbolResolver {}

    impl SymbolResolver for DebugSymbolResolver {
        fn resolve(&self, module: &LoadedModule, method: &str) -> Result<Option<u64>> {
            let path = match module.path.as_deref() {
                Some(p) => p,
                None => return Ok(None),
            };
            match super::resolve_via_debug_symbols(
                self.process_handle,
                module.base,
                module.size as u32,
                path,
                &module.name,
                method,
            ) {
                Ok(address) => Ok(Some(address)),
                Err(_) => Ok(None),
            }
        }
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::cell::RefCell;

    #[derive(Default)]
    pub struct ScriptedModuleEnumerator {
        modules: RefCell<Vec<LoadedModule>>,
    }

    impl ScriptedModuleEnumerator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, module: LoadedModule) {
            self.modules.borrow_mut().push(module);
        }
    }

    impl ModuleEnumerator for ScriptedModuleEnumerator {
        fn list_modules(&self) -> Result<Vec<LoadedModule>> {
            Ok(self.modules.borrow().clone())
        }
    }
}

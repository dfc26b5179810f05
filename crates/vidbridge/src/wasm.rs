//! Engine hosted in a WebAssembly module.
//!
//! The module owns a linear memory and exports its allocator and the
//! transcode entry points:
//!
//! | export | signature |
//! |--------|-----------|
//! | `memory` | linear memory |
//! | `malloc` / `_malloc` | `(size: i32) -> i32` |
//! | `free` / `_free` | `(ptr: i32)` |
//! | `transcode` / `_transcode` | `(input, input_len, format, video_codec, audio_codec, video_bitrate, audio_bitrate, resolution) -> record` |
//! | `free_transcode_result` / `_free_transcode_result` | `(record: i32)` |
//! | `init_ffmpeg` / `_init_ffmpeg` | optional, `()` or `() -> i32` (nonzero fails the load) |
//! | `transcode_result_size` | optional, `() -> i32` |
//! | `fs_write_file` | optional, `(name, data, len) -> i32` (nonzero fails) |
//! | `fs_read_file` | optional, `(name, len_out) -> data` (0 if missing, freed with `free`) |
//! | `run` / `_run` | optional, `(argc, argv) -> i32` exit code, argv NULL-terminated |
//!
//! String arguments are NUL-terminated and live only for the duration of the
//! call. The host provides `env.report_progress(percent: f64)` and
//! `env.log_line(ptr: i32, len: i32)` for the module to import.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vidbridge_core::{
    Arena, ArenaPtr, BridgeError, Engine, EventSink, Result, TranscodeCall,
};
use wasmtime::{
    Caller, Extern, Func, Instance, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, TypedFunc, Val,
};

/// Size of one wasm page.
const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Default maximum memory: 32768 pages (2 GiB).
const DEFAULT_MAX_MEMORY_PAGES: u32 = 32 * 1024;

type TranscodeParams = (u32, u32, u32, u32, u32, i32, i32, u32);

/// Configuration for loading a [`WasmEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WasmEngineConfig {
    /// Path to the `.wasm` (or `.wat`) module
    pub module_path: PathBuf,
    /// Upper bound on linear memory growth, in 64 KiB pages
    #[serde(default = "default_max_memory_pages")]
    pub max_memory_pages: u32,
}

fn default_max_memory_pages() -> u32 {
    DEFAULT_MAX_MEMORY_PAGES
}

impl WasmEngineConfig {
    pub fn new(module_path: impl Into<PathBuf>) -> Self {
        Self {
            module_path: module_path.into(),
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
        }
    }

    pub fn with_max_memory_pages(mut self, pages: u32) -> Self {
        self.max_memory_pages = pages;
        self
    }
}

/// Per-store host state.
struct HostState {
    /// Sink of the call in progress, if any
    events: Option<Arc<dyn EventSink>>,
    limits: StoreLimits,
}

/// The module's linear memory, allocated through its own `malloc`/`free`.
pub struct WasmArena {
    store: Store<HostState>,
    memory: Memory,
    malloc: TypedFunc<u32, u32>,
    free: TypedFunc<u32, ()>,
}

impl WasmArena {
    fn alloc_cstring(&mut self, s: &str) -> Result<ArenaPtr> {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);

        let ptr = self.allocate(bytes.len() as u32)?;
        if let Err(e) = self.write(ptr, &bytes) {
            self.release_logged(ptr);
            return Err(e);
        }
        Ok(ptr)
    }

    fn release_logged(&mut self, ptr: ArenaPtr) {
        if let Err(e) = self.release(ptr) {
            warn!(ptr = %ptr, error = %e, "failed to release module allocation");
        }
    }
}

impl Arena for WasmArena {
    fn allocate(&mut self, size: u32) -> Result<ArenaPtr> {
        let ptr = self
            .malloc
            .call(&mut self.store, size)
            .map_err(trap_error)?;
        if ptr == 0 {
            return Err(BridgeError::OutOfMemory {
                requested: size as u64,
            });
        }
        Ok(ArenaPtr::new(ptr))
    }

    fn release(&mut self, ptr: ArenaPtr) -> Result<()> {
        self.free
            .call(&mut self.store, ptr.offset())
            .map_err(trap_error)
    }

    fn memory(&self) -> &[u8] {
        self.memory.data(&self.store)
    }

    fn memory_mut(&mut self) -> &mut [u8] {
        self.memory.data_mut(&mut self.store)
    }
}

/// A transcoding engine running inside wasmtime.
pub struct WasmEngine {
    arena: WasmArena,
    transcode: TypedFunc<TranscodeParams, u32>,
    free_result: TypedFunc<u32, ()>,
    init: Option<Func>,
    record_size: Option<u32>,
    fs_write: Option<TypedFunc<(u32, u32, u32), i32>>,
    fs_read: Option<TypedFunc<(u32, u32), u32>>,
    run: Option<TypedFunc<(u32, u32), i32>>,
}

impl WasmEngine {
    /// Read and instantiate the module named by `config`.
    pub fn from_config(config: &WasmEngineConfig) -> Result<Self> {
        let bytes = std::fs::read(&config.module_path).map_err(|e| {
            BridgeError::LoadFailure(format!(
                "failed to read {}: {}",
                config.module_path.display(),
                e
            ))
        })?;
        Self::from_bytes(&bytes, config.max_memory_pages)
    }

    /// Instantiate a module from binary or text format.
    pub fn from_bytes(wasm: &[u8], max_memory_pages: u32) -> Result<Self> {
        let engine = wasmtime::Engine::default();
        let module = Module::new(&engine, wasm).map_err(load_error)?;

        let mut linker = Linker::new(&engine);
        register_host_functions(&mut linker)?;

        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_pages as usize * WASM_PAGE_SIZE)
            .build();
        let mut store = Store::new(
            &engine,
            HostState {
                events: None,
                limits,
            },
        );
        store.limiter(|state| &mut state.limits);

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(load_error)?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or_else(|| BridgeError::LoadFailure("module does not export memory".into()))?;

        let malloc = required(&instance, &mut store, &["malloc", "_malloc"])?;
        let free = required(&instance, &mut store, &["free", "_free"])?;
        let transcode = required(&instance, &mut store, &["transcode", "_transcode"])?;
        let free_result = required(
            &instance,
            &mut store,
            &["free_transcode_result", "_free_transcode_result"],
        )?;
        let init = ["init_ffmpeg", "_init_ffmpeg"]
            .iter()
            .find_map(|name| instance.get_func(&mut store, name));
        let record_size_fn: Option<TypedFunc<(), u32>> =
            optional(&instance, &mut store, "transcode_result_size")?;
        let fs_write = optional(&instance, &mut store, "fs_write_file")?;
        let fs_read = optional(&instance, &mut store, "fs_read_file")?;
        let run = match optional(&instance, &mut store, "run")? {
            Some(run) => Some(run),
            None => optional(&instance, &mut store, "_run")?,
        };

        let record_size = match record_size_fn {
            Some(f) => Some(f.call(&mut store, ()).map_err(load_error)?),
            None => None,
        };

        info!(
            memory_pages = memory.size(&store),
            record_size, "wasm module instantiated"
        );

        Ok(Self {
            arena: WasmArena {
                store,
                memory,
                malloc,
                free,
            },
            transcode,
            free_result,
            init,
            record_size,
            fs_write,
            fs_read,
            run,
        })
    }

    fn release_all(&mut self, ptrs: &[ArenaPtr]) {
        for &ptr in ptrs {
            self.arena.release_logged(ptr);
        }
    }
}

impl Engine for WasmEngine {
    fn init(&mut self) -> Result<()> {
        let Some(init) = self.init else {
            return Ok(());
        };
        let store = &mut self.arena.store;
        let mut results = vec![Val::I32(0); init.ty(&*store).results().len()];
        init.call(&mut *store, &[], &mut results).map_err(|e| {
            BridgeError::LoadFailure(format!("init_ffmpeg trapped: {}", e.root_cause()))
        })?;

        match results.first() {
            Some(Val::I32(code)) if *code != 0 => Err(BridgeError::LoadFailure(format!(
                "init_ffmpeg returned {}",
                code
            ))),
            _ => Ok(()),
        }
    }

    fn result_record_size(&self) -> Option<u32> {
        self.record_size
    }

    fn arena(&self) -> &dyn Arena {
        &self.arena
    }

    fn arena_mut(&mut self) -> &mut dyn Arena {
        &mut self.arena
    }

    fn transcode(
        &mut self,
        call: TranscodeCall<'_>,
        events: &Arc<dyn EventSink>,
    ) -> Result<ArenaPtr> {
        let options = call.options;
        let mut strings = Vec::with_capacity(4);
        for s in [
            options.output_format.as_str(),
            options.video_codec.as_str(),
            options.audio_codec.as_str(),
            options.resolution.as_str(),
        ] {
            match self.arena.alloc_cstring(s) {
                Ok(ptr) => strings.push(ptr),
                Err(e) => {
                    self.release_all(&strings);
                    return Err(e);
                }
            }
        }

        let params = (
            call.input.offset(),
            call.input_len,
            strings[0].offset(),
            strings[1].offset(),
            strings[2].offset(),
            options.video_bitrate,
            options.audio_bitrate,
            strings[3].offset(),
        );

        self.arena.store.data_mut().events = Some(Arc::clone(events));
        let outcome = self.transcode.call(&mut self.arena.store, params);
        self.arena.store.data_mut().events = None;
        self.release_all(&strings);

        let record = outcome.map_err(trap_error)?;
        debug!(record = record, "module transcode returned");
        Ok(ArenaPtr::new(record))
    }

    fn run(&mut self, args: &[String], events: &Arc<dyn EventSink>) -> Result<()> {
        let run = self.run.clone().ok_or_else(|| shim_missing("run"))?;

        let mut owned = Vec::with_capacity(args.len() + 1);
        for arg in args {
            match self.arena.alloc_cstring(arg) {
                Ok(ptr) => owned.push(ptr),
                Err(e) => {
                    self.release_all(&owned);
                    return Err(e);
                }
            }
        }
        let argc = owned.len() as u32;
        let mut argv_bytes: Vec<u8> = owned
            .iter()
            .flat_map(|ptr| ptr.offset().to_le_bytes())
            .collect();
        argv_bytes.extend_from_slice(&0u32.to_le_bytes());
        let argv = match self.arena.allocate(argv_bytes.len() as u32) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.release_all(&owned);
                return Err(e);
            }
        };
        owned.push(argv);

        let outcome = self.arena.write(argv, &argv_bytes).and_then(|()| {
            self.arena.store.data_mut().events = Some(Arc::clone(events));
            let code = run.call(&mut self.arena.store, (argc, argv.offset()));
            self.arena.store.data_mut().events = None;
            code.map_err(trap_error)
        });
        self.release_all(&owned);

        match outcome? {
            0 => Ok(()),
            code => Err(BridgeError::EngineFailure(format!(
                "run exited with code {}",
                code
            ))),
        }
    }

    fn free_result(&mut self, record: ArenaPtr) -> Result<()> {
        self.free_result
            .call(&mut self.arena.store, record.offset())
            .map_err(trap_error)
    }

    fn write_file(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let fs_write = self
            .fs_write
            .clone()
            .ok_or_else(|| shim_missing("fs_write_file"))?;

        let name_ptr = self.arena.alloc_cstring(name)?;
        let data_ptr = match self.arena.allocate(data.len() as u32) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.release_all(&[name_ptr]);
                return Err(e);
            }
        };
        let outcome = self
            .arena
            .write(data_ptr, data)
            .and_then(|()| {
                fs_write
                    .call(
                        &mut self.arena.store,
                        (name_ptr.offset(), data_ptr.offset(), data.len() as u32),
                    )
                    .map_err(trap_error)
            });
        self.release_all(&[name_ptr, data_ptr]);

        match outcome? {
            0 => Ok(()),
            code => Err(BridgeError::EngineFailure(format!(
                "failed to write {} (code {})",
                name, code
            ))),
        }
    }

    fn read_file(&mut self, name: &str) -> Result<Vec<u8>> {
        let fs_read = self
            .fs_read
            .clone()
            .ok_or_else(|| shim_missing("fs_read_file"))?;

        let name_ptr = self.arena.alloc_cstring(name)?;
        let len_ptr = match self.arena.allocate(4) {
            Ok(ptr) => ptr,
            Err(e) => {
                self.release_all(&[name_ptr]);
                return Err(e);
            }
        };
        let outcome = fs_read
            .call(&mut self.arena.store, (name_ptr.offset(), len_ptr.offset()))
            .map_err(trap_error)
            .and_then(|data| {
                let len = self.arena.read_u32(len_ptr)?;
                Ok((ArenaPtr::new(data), len))
            });
        self.release_all(&[name_ptr, len_ptr]);

        let (data, len) = outcome?;
        if data.is_null() {
            return Err(BridgeError::FileNotFound(name.to_string()));
        }
        let bytes = self.arena.read(data, len);
        self.release_all(&[data]);
        bytes
    }
}

fn register_host_functions(linker: &mut Linker<HostState>) -> Result<()> {
    linker
        .func_wrap(
            "env",
            "report_progress",
            |caller: Caller<'_, HostState>, percent: f64| {
                if let Some(events) = &caller.data().events {
                    events.progress(percent);
                }
            },
        )
        .map_err(load_error)?;

    linker
        .func_wrap(
            "env",
            "log_line",
            |mut caller: Caller<'_, HostState>, ptr: u32, len: u32| {
                let Some(Extern::Memory(memory)) = caller.get_export("memory") else {
                    return;
                };
                let start = ptr as usize;
                let line = memory
                    .data(&caller)
                    .get(start..start.saturating_add(len as usize))
                    .map(|bytes| String::from_utf8_lossy(bytes).into_owned());
                if let (Some(line), Some(events)) = (line, &caller.data().events) {
                    events.log(&line);
                }
            },
        )
        .map_err(load_error)?;

    Ok(())
}

fn required<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    names: &[&str],
) -> Result<TypedFunc<P, R>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    for name in names {
        if instance.get_func(&mut *store, name).is_some() {
            return instance
                .get_typed_func(&mut *store, name)
                .map_err(|e| BridgeError::LoadFailure(format!("export {}: {}", name, e)));
        }
    }
    Err(BridgeError::LoadFailure(format!(
        "module does not export {}",
        names.join(" or ")
    )))
}

fn optional<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &str,
) -> Result<Option<TypedFunc<P, R>>>
where
    P: wasmtime::WasmParams,
    R: wasmtime::WasmResults,
{
    match instance.get_func(&mut *store, name) {
        Some(_) => required(instance, store, &[name]).map(Some),
        None => Ok(None),
    }
}

fn load_error(e: wasmtime::Error) -> BridgeError {
    BridgeError::LoadFailure(e.to_string())
}

fn trap_error(e: wasmtime::Error) -> BridgeError {
    BridgeError::EngineFailure(e.root_cause().to_string())
}

fn shim_missing(export: &str) -> BridgeError {
    BridgeError::EngineFailure(format!("module does not export {}", export))
}

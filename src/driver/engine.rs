use std::collections::HashMap;
use std::ffi::c_void;

use crate::backend::{
    emit_kernel, emitter::KERNEL_NAME, Backend, BackendKind, OpenclBackend, OpenmpBackend,
    SymbolTable,
};
use crate::common::{Error, Result};
use crate::driver::compiler::ExternalCompiler;
use crate::driver::config::Config;
use crate::driver::store::ObjectStore;
use crate::ir::{BaseArena, BaseId, Instruction, Opcode};
use crate::passes::{build_block_tree, prune, stamp_constructors, LoopBlock, Pruned};

/// Host callback implementing one extension method.
pub type ExtMethodFn = Box<dyn Fn(&mut BaseArena, &Instruction) -> Result<()>>;

/// Drives one batch through the pipeline: prune, constructor stamping,
/// block-tree fusion, symbol assignment, source emission, store lookup,
/// external compilation on miss, and invocation of the loaded entry
/// point.
pub struct Engine {
    config: Config,
    store: ObjectStore,
    compiler: ExternalCompiler,
    backend: Box<dyn Backend>,
    extmethods: HashMap<u32, (String, ExtMethodFn)>,
    next_ext_id: u32,
    compile_count: u64,
}

impl Engine {
    pub fn new(config: Config) -> Result<Engine> {
        let backend: Box<dyn Backend> = match config.backend {
            BackendKind::Openmp => Box::new(OpenmpBackend::new(config.annotation)),
            BackendKind::Opencl => Box::new(OpenclBackend),
        };
        let mut store = ObjectStore::new(&config)?;
        let preloaded = store.preload()?;
        if preloaded > 0 {
            log::info!("preloaded {preloaded} cached kernels");
        }
        Ok(Engine {
            compiler: ExternalCompiler::from_config(&config),
            store,
            backend,
            extmethods: HashMap::new(),
            next_ext_id: 0,
            compile_count: 0,
            config,
        })
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// External compiler invocations so far (cache misses).
    pub fn compile_count(&self) -> u64 {
        self.compile_count
    }

    pub fn compiler_available(&self) -> bool {
        self.compiler.available()
    }

    /// Register a named extension method; instructions invoke it as
    /// `Opcode::Extension(id)` with the returned id.
    pub fn register_extmethod(&mut self, name: &str, f: ExtMethodFn) -> u32 {
        let id = self.next_ext_id;
        self.next_ext_id += 1;
        self.extmethods.insert(id, (name.to_string(), f));
        id
    }

    pub fn extmethod_id(&self, name: &str) -> Option<u32> {
        self.extmethods.iter().find(|(_, (n, _))| n == name).map(|(id, _)| *id)
    }

    /// Process one batch. Extension methods split the batch: everything
    /// before them is fused and run, then the callback executes on host
    /// storage.
    pub fn execute(&mut self, arena: &mut BaseArena, batch: Vec<Instruction>) -> Result<()> {
        for instr in &batch {
            instr.validate()?;
        }
        let Pruned { mut instrs, frees } = prune(batch);
        stamp_constructors(&mut instrs);

        let mut segment: Vec<Instruction> = Vec::new();
        let mut syncs: Vec<BaseId> = Vec::new();
        for instr in instrs {
            match instr.opcode {
                Opcode::Sync => {
                    if let Some(v) = instr.operands[0].view() {
                        syncs.push(v.base);
                    }
                }
                Opcode::Extension(id) => {
                    let pending = std::mem::take(&mut segment);
                    self.run_segment(arena, pending)?;
                    self.run_extension(arena, id, &instr)?;
                }
                _ => segment.push(instr),
            }
        }
        self.run_segment(arena, segment)?;

        for base in syncs {
            arena.get_mut(base).materialize();
        }
        for base in frees {
            arena.get_mut(base).release();
        }
        Ok(())
    }

    fn run_extension(&mut self, arena: &mut BaseArena, id: u32, instr: &Instruction) -> Result<()> {
        let (name, f) = self
            .extmethods
            .get(&id)
            .ok_or_else(|| Error::UnsupportedOpcode(instr.to_string()))?;
        log::debug!("extension method {name}");
        // The callback gets the whole arena; every operand base counts as
        // written and must stay an array in later kernels.
        for base in instr.bases() {
            arena.get_mut(base).extension_written = true;
        }
        f(arena, instr)
    }

    /// Fuse, emit, cache-or-compile, and invoke one instruction segment.
    fn run_segment(&mut self, arena: &mut BaseArena, instrs: Vec<Instruction>) -> Result<()> {
        if instrs.is_empty() {
            return Ok(());
        }
        let root = build_block_tree(instrs);
        let freed: Vec<BaseId> = root
            .all_instrs()
            .iter()
            .filter(|i| i.opcode == Opcode::Free)
            .filter_map(|i| i.operands[0].view().map(|v| v.base))
            .collect();
        if root.is_system_only() {
            for base in &freed {
                arena.get_mut(*base).release();
            }
            return Ok(());
        }

        let symbols =
            SymbolTable::build(&root, arena, self.config.scalar_replacement_threshold);
        let source = emit_kernel(&root, &symbols, self.backend.as_ref())?;
        let symbol = format!("{:x}", md5::compute(source.as_bytes()));
        log::debug!("kernel {symbol} ({} instructions)", root.all_instrs().len());

        if !self.store.ready(&symbol) {
            if !self.store.knows(&symbol) {
                self.compile(&symbol, &source)?;
                let object = self.store.object_path(&symbol);
                self.store.insert_symbol(symbol.clone(), object);
            }
            self.store.load(&symbol)?;
        }

        let mut args = ArgPack::build(&symbols, arena);
        self.store.call(&symbol, args.argv_mut())?;

        for base in &freed {
            arena.get_mut(*base).release();
        }
        Ok(())
    }

    /// Write the named source and run the external compiler. The source
    /// stays on disk either way: as post-mortem on failure, as the cache
    /// sibling on success.
    fn compile(&mut self, symbol: &str, source: &str) -> Result<()> {
        let entry = format!("{}{symbol}", self.config.kernel_prefix);
        let named = source.replace(KERNEL_NAME, &entry);
        let source_path = self.store.source_path(symbol);
        std::fs::write(&source_path, named)?;
        let object_path = self.store.object_path(symbol);
        self.compiler.compile(&source_path, &object_path)?;
        self.compile_count += 1;
        Ok(())
    }

    /// Emit without executing; used by tests and diagnostics.
    pub fn emit_source(&self, arena: &BaseArena, batch: Vec<Instruction>) -> Result<String> {
        for instr in &batch {
            instr.validate()?;
        }
        let Pruned { mut instrs, .. } = prune(batch);
        stamp_constructors(&mut instrs);
        let root: LoopBlock = build_block_tree(instrs);
        let symbols =
            SymbolTable::build(&root, arena, self.config.scalar_replacement_threshold);
        emit_kernel(&root, &symbols, self.backend.as_ref())
    }
}

/// Kernel argument vector in symbol-table order: base pointers, then per
/// offset/stride view the offset and per-axis strides, then constants.
/// Owns the scalar storage the pointers refer to.
struct ArgPack {
    _scalars: Vec<u64>,
    _consts: Vec<[u8; 16]>,
    argv: Vec<*mut c_void>,
}

impl ArgPack {
    fn build(symbols: &SymbolTable, arena: &mut BaseArena) -> ArgPack {
        let mut ptrs: Vec<*mut c_void> = Vec::new();
        for base in symbols.params() {
            ptrs.push(arena.get_mut(base).as_mut_ptr() as *mut c_void);
        }

        let nscalars: usize =
            symbols.offset_stride_views().map(|v| 1 + v.ndim()).sum();
        let mut scalars: Vec<u64> = Vec::with_capacity(nscalars);
        for view in symbols.offset_stride_views() {
            scalars.push(view.start as u64);
            for &s in &view.stride {
                scalars.push(s as u64);
            }
        }
        let consts: Vec<[u8; 16]> = symbols.consts().map(|(_, c)| c.to_bytes()).collect();

        let mut argv = ptrs;
        for scalar in &scalars {
            argv.push(scalar as *const u64 as *mut c_void);
        }
        for blob in &consts {
            argv.push(blob.as_ptr() as *mut c_void);
        }
        ArgPack { _scalars: scalars, _consts: consts, argv }
    }

    fn argv_mut(&mut self) -> &mut [*mut c_void] {
        &mut self.argv
    }
}

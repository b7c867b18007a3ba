use crate::common::{ElemType, Error, Result};
use crate::driver::config::Config;
use crate::driver::engine::{Engine, ExtMethodFn};
use crate::ir::{random123, BaseArena, BaseId, Instruction, Opcode, Operand, View};

/// The front-facing API the recording layer drives: a deferred
/// instruction queue, flush variants, extension methods, host sync, and
/// the counter-based RNG source.
pub struct Runtime {
    engine: Engine,
    arena: BaseArena,
    queue: Vec<Instruction>,
    last_batch: Vec<Instruction>,
    flush_count: u64,
}

impl Runtime {
    pub fn new(config: Config) -> Result<Runtime> {
        Ok(Runtime {
            engine: Engine::new(config)?,
            arena: BaseArena::new(),
            queue: Vec::new(),
            last_batch: Vec::new(),
            flush_count: 0,
        })
    }

    pub fn arena(&self) -> &BaseArena {
        &self.arena
    }

    pub fn arena_mut(&mut self) -> &mut BaseArena {
        &mut self.arena
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Allocate a base the front end can build views over.
    pub fn new_base(&mut self, dtype: ElemType, nelem: usize) -> BaseId {
        self.arena.alloc(dtype, nelem)
    }

    /// Defer an instruction until the next flush.
    pub fn record(&mut self, instr: Instruction) {
        self.queue.push(instr);
    }

    /// Process a batch immediately.
    pub fn execute(&mut self, batch: Vec<Instruction>) -> Result<()> {
        self.engine.execute(&mut self.arena, batch.clone())?;
        self.last_batch = batch;
        self.flush_count += 1;
        Ok(())
    }

    /// Run the deferred queue.
    pub fn flush(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.queue);
        if batch.is_empty() {
            return Ok(());
        }
        self.execute(batch)
    }

    /// How many batches have been executed.
    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }

    /// Flush, then re-execute the last batch while `condition` reads
    /// non-zero and fewer than `nrepeats` repeats have run. Returns the
    /// number of repeats executed.
    pub fn flush_count_and_repeat(&mut self, nrepeats: u64, condition: &View) -> Result<u64> {
        self.flush()?;
        let mut repeats = 0;
        while repeats < nrepeats && self.read_condition(condition)? {
            let batch = self.last_batch.clone();
            if batch.is_empty() {
                break;
            }
            self.engine.execute(&mut self.arena, batch)?;
            self.flush_count += 1;
            repeats += 1;
        }
        Ok(repeats)
    }

    fn read_condition(&self, condition: &View) -> Result<bool> {
        let base = self.arena.get(condition.base);
        if !base.is_materialized() {
            return Ok(false);
        }
        let at = condition.start as usize;
        if at >= base.nelem {
            return Err(Error::Structural(format!(
                "condition view start {at} outside base of {} elements",
                base.nelem
            )));
        }
        let value = match base.dtype {
            ElemType::Bool | ElemType::UInt8 => unsafe { base.slice::<u8>()[at] as u64 },
            ElemType::Int8 => unsafe { base.slice::<i8>()[at].unsigned_abs() as u64 },
            ElemType::Int16 => unsafe { base.slice::<i16>()[at].unsigned_abs() as u64 },
            ElemType::UInt16 => unsafe { base.slice::<u16>()[at] as u64 },
            ElemType::Int32 => unsafe { base.slice::<i32>()[at].unsigned_abs() as u64 },
            ElemType::UInt32 => unsafe { base.slice::<u32>()[at] as u64 },
            ElemType::Int64 => unsafe { base.slice::<i64>()[at].unsigned_abs() },
            ElemType::UInt64 => unsafe { base.slice::<u64>()[at] },
            ElemType::Float32 => unsafe { (base.slice::<f32>()[at] != 0.0) as u64 },
            ElemType::Float64 => unsafe { (base.slice::<f64>()[at] != 0.0) as u64 },
            other => {
                return Err(Error::Structural(format!(
                    "condition view of unsupported dtype {other:?}"
                )))
            }
        };
        Ok(value != 0)
    }

    /// Ensure the base behind `view` is materialised in host memory.
    pub fn sync(&mut self, view: &View) -> Result<()> {
        self.flush()?;
        self.arena.get_mut(view.base).materialize();
        Ok(())
    }

    /// Flat `uint64` array filled by the counter-based RNG.
    pub fn random123(&mut self, size: usize, seed: u64, key: u64) -> Result<BaseId> {
        self.flush()?;
        let id = self.arena.alloc(ElemType::UInt64, size);
        let buf = unsafe { self.arena.get_mut(id).slice_mut::<u64>() };
        random123::fill(buf, seed, key);
        Ok(id)
    }

    pub fn register_extmethod(&mut self, name: &str, f: ExtMethodFn) -> u32 {
        self.engine.register_extmethod(name, f)
    }

    /// Queue an invocation of a registered extension method. Operands
    /// must share one dtype; constants are not permitted.
    pub fn extmethod(&mut self, name: &str, operands: Vec<View>) -> Result<()> {
        let Some(id) = self.engine.extmethod_id(name) else {
            return Err(Error::Runtime(format!("extension method \"{name}\" is not registered")));
        };
        let Some(first) = operands.first() else {
            return Err(Error::Structural("extension method without operands".into()));
        };
        let dtype = self.arena.get(first.base).dtype;
        for view in &operands {
            if self.arena.get(view.base).dtype != dtype {
                return Err(Error::Structural(
                    "extension method operands must share one dtype".into(),
                ));
            }
        }
        self.queue
            .push(Instruction::new(Opcode::Extension(id), operands.into_iter().map(Operand::View).collect()));
        Ok(())
    }
}

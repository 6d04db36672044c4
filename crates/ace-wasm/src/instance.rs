//! A live instance of the accelerated module.

use crate::{WasmError, WasmResult, PAGE_SIZE};
use ace_rts_arena::{AllocError, AllocResult, ForeignAllocator, TypeTag};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use wasmtime::{
    Caller, Engine, Instance, Linker, Memory, Module, Store, StoreLimits, StoreLimitsBuilder,
    TypedFunc, WasmParams, WasmResults,
};

/// Largest block the allocator is asked for; keeps header arithmetic in range.
const MAX_BLOCK: usize = i32::MAX as usize - 64;

/// Kernels exported by the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelExport {
    /// `sum_f64(p, n) -> f64`
    Sum,
    /// `dot_f64(a, b, n) -> f64`
    Dot,
    /// `add_f64(a, b, out, n)`
    Add,
    /// `sub_f64(a, b, out, n)`
    Sub,
    /// `mul_f64(a, b, out, n)`
    Mul,
    /// `scale_f64(a, s, out, n)`
    Scale,
    /// `matmul_f64(a, b, out, m, k, n)`
    MatMul,
    /// `transpose_f64(a, out, rows, cols)`
    Transpose,
}

impl KernelExport {
    /// Every kernel export.
    pub const ALL: [Self; 8] = [
        Self::Sum,
        Self::Dot,
        Self::Add,
        Self::Sub,
        Self::Mul,
        Self::Scale,
        Self::MatMul,
        Self::Transpose,
    ];

    /// Name of the export in the module.
    #[must_use]
    pub const fn export_name(self) -> &'static str {
        match self {
            Self::Sum => "sum_f64",
            Self::Dot => "dot_f64",
            Self::Add => "add_f64",
            Self::Sub => "sub_f64",
            Self::Mul => "mul_f64",
            Self::Scale => "scale_f64",
            Self::MatMul => "matmul_f64",
            Self::Transpose => "transpose_f64",
        }
    }
}

/// Element-wise binary operations with an accelerated kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
}

impl BinaryOp {
    /// The kernel implementing this operation.
    #[must_use]
    pub const fn kernel(self) -> KernelExport {
        match self {
            Self::Add => KernelExport::Add,
            Self::Sub => KernelExport::Sub,
            Self::Mul => KernelExport::Mul,
        }
    }
}

/// Arguments the module passed to `env.abort`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortInfo {
    /// Message pointer (0 if none).
    pub message: u32,
    /// File name pointer (0 if none).
    pub file: u32,
    /// Line, or an abort code for the bundled module.
    pub line: u32,
    /// Column.
    pub column: u32,
}

pub(crate) struct HostState {
    limits: StoreLimits,
    abort: Option<AbortInfo>,
}

struct Exports {
    new: TypedFunc<(i32, i32), i32>,
    pin: TypedFunc<i32, i32>,
    unpin: TypedFunc<i32, ()>,
    collect: TypedFunc<(), ()>,
    sum: TypedFunc<(i32, i32), f64>,
    dot: TypedFunc<(i32, i32, i32), f64>,
    add: TypedFunc<(i32, i32, i32, i32), ()>,
    sub: TypedFunc<(i32, i32, i32, i32), ()>,
    mul: TypedFunc<(i32, i32, i32, i32), ()>,
    scale: TypedFunc<(i32, f64, i32, i32), ()>,
    matmul: TypedFunc<(i32, i32, i32, i32, i32, i32), ()>,
    transpose: TypedFunc<(i32, i32, i32, i32), ()>,
    rand: Option<TypedFunc<(), f64>>,
}

/// An instantiated accelerated module with its own store and linear memory.
///
/// Not shareable across threads concurrently; callers serialize access.
pub struct AcceleratedInstance {
    store: Store<HostState>,
    memory: Memory,
    exports: Exports,
}

fn typed<P, R>(
    instance: &Instance,
    store: &mut Store<HostState>,
    name: &'static str,
) -> WasmResult<TypedFunc<P, R>>
where
    P: WasmParams,
    R: WasmResults,
{
    instance
        .get_typed_func::<P, R>(store, name)
        .map_err(|e| WasmError::MissingExport {
            name,
            message: e.to_string(),
        })
}

#[inline]
fn ptr(offset: u32) -> i32 {
    i32::from_ne_bytes(offset.to_ne_bytes())
}

#[inline]
fn offset(ptr: i32) -> u32 {
    u32::from_ne_bytes(ptr.to_ne_bytes())
}

fn count(n: usize) -> WasmResult<i32> {
    i32::try_from(n).map_err(|_| WasmError::OutOfBounds {
        offset: 0,
        len: n.saturating_mul(8),
    })
}

fn trap(kernel: KernelExport, err: &wasmtime::Error) -> WasmError {
    WasmError::Trap {
        kernel: kernel.export_name(),
        message: err.to_string(),
    }
}

impl AcceleratedInstance {
    /// Instantiate `module`, capping its memory at `max_memory_pages`.
    pub(crate) fn instantiate(
        engine: &Engine,
        module: &Module,
        max_memory_pages: u32,
    ) -> WasmResult<Self> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(max_memory_pages as usize * PAGE_SIZE)
            .instances(1)
            .build();
        let mut store = Store::new(engine, HostState {
            limits,
            abort: None,
        });
        store.limiter(|state| &mut state.limits);

        let mut linker: Linker<HostState> = Linker::new(engine);
        linker
            .func_wrap(
                "env",
                "abort",
                |mut caller: Caller<'_, HostState>,
                 message: i32,
                 file: i32,
                 line: i32,
                 column: i32|
                 -> wasmtime::Result<()> {
                    let info = AbortInfo {
                        message: offset(message),
                        file: offset(file),
                        line: offset(line),
                        column: offset(column),
                    };
                    caller.data_mut().abort = Some(info);
                    Err(wasmtime::Error::msg(format!(
                        "module aborted at {}:{}",
                        info.line, info.column
                    )))
                },
            )
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;
        linker
            .func_wrap("env", "seed", || -> f64 {
                SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs_f64() * 1000.0)
                    .unwrap_or(0.0)
            })
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| WasmError::Instantiate(e.to_string()))?;
        let memory = instance
            .get_memory(&mut store, "memory")
            .ok_or(WasmError::MissingExport {
                name: "memory",
                message: "no exported memory".to_string(),
            })?;

        let exports = Exports {
            new: typed(&instance, &mut store, "__new")?,
            pin: typed(&instance, &mut store, "__pin")?,
            unpin: typed(&instance, &mut store, "__unpin")?,
            collect: typed(&instance, &mut store, "__collect")?,
            sum: typed(&instance, &mut store, KernelExport::Sum.export_name())?,
            dot: typed(&instance, &mut store, KernelExport::Dot.export_name())?,
            add: typed(&instance, &mut store, KernelExport::Add.export_name())?,
            sub: typed(&instance, &mut store, KernelExport::Sub.export_name())?,
            mul: typed(&instance, &mut store, KernelExport::Mul.export_name())?,
            scale: typed(&instance, &mut store, KernelExport::Scale.export_name())?,
            matmul: typed(&instance, &mut store, KernelExport::MatMul.export_name())?,
            transpose: typed(&instance, &mut store, KernelExport::Transpose.export_name())?,
            rand: typed(&instance, &mut store, "rand_f64").ok(),
        };

        Ok(Self {
            store,
            memory,
            exports,
        })
    }

    /// Current size of linear memory in bytes.
    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.memory.data_size(&self.store)
    }

    /// The arguments of the most recent `env.abort` call, if any.
    #[must_use]
    pub fn last_abort(&self) -> Option<AbortInfo> {
        self.store.data().abort
    }

    // ========================================================================
    // Memory access
    // ========================================================================

    /// Copy `data` into linear memory at `offset`.
    pub fn write_f64(&mut self, offset: u32, data: &[f64]) -> WasmResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.memory
            .write(&mut self.store, offset as usize, bytes)
            .map_err(|_| WasmError::OutOfBounds {
                offset,
                len: bytes.len(),
            })
    }

    /// Copy `out.len()` values out of linear memory at `offset`.
    pub fn read_f64_into(&self, offset: u32, out: &mut [f64]) -> WasmResult<()> {
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(out);
        let len = bytes.len();
        self.memory
            .read(&self.store, offset as usize, bytes)
            .map_err(|_| WasmError::OutOfBounds { offset, len })
    }

    /// Read `len` values out of linear memory at `offset`.
    pub fn read_f64(&self, offset: u32, len: usize) -> WasmResult<Vec<f64>> {
        let mut out = vec![0.0; len];
        self.read_f64_into(offset, &mut out)?;
        Ok(out)
    }

    /// Allocate, pin and fill a block with `data`, bypassing any pool.
    pub fn alloc_f64(&mut self, data: &[f64]) -> WasmResult<u32> {
        let offset = self.allocate(std::mem::size_of_val(data), TypeTag::F64Array)?;
        self.pin(offset)?;
        self.write_f64(offset, data)?;
        Ok(offset)
    }

    // ========================================================================
    // Kernels
    // ========================================================================

    /// Sum of `n` values at `p`.
    pub fn sum_f64(&mut self, p: u32, n: usize) -> WasmResult<f64> {
        self.exports
            .sum
            .call(&mut self.store, (ptr(p), count(n)?))
            .map_err(|e| trap(KernelExport::Sum, &e))
    }

    /// Inner product of `n` values at `a` and `b`.
    pub fn dot_f64(&mut self, a: u32, b: u32, n: usize) -> WasmResult<f64> {
        self.exports
            .dot
            .call(&mut self.store, (ptr(a), ptr(b), count(n)?))
            .map_err(|e| trap(KernelExport::Dot, &e))
    }

    /// `out[i] = a[i] op b[i]` for `n` values.
    pub fn binary_f64(&mut self, op: BinaryOp, a: u32, b: u32, out: u32, n: usize) -> WasmResult<()> {
        let func = match op {
            BinaryOp::Add => &self.exports.add,
            BinaryOp::Sub => &self.exports.sub,
            BinaryOp::Mul => &self.exports.mul,
        };
        func.call(&mut self.store, (ptr(a), ptr(b), ptr(out), count(n)?))
            .map_err(|e| trap(op.kernel(), &e))
    }

    /// `out[i] = a[i] * s` for `n` values.
    pub fn scale_f64(&mut self, a: u32, s: f64, out: u32, n: usize) -> WasmResult<()> {
        self.exports
            .scale
            .call(&mut self.store, (ptr(a), s, ptr(out), count(n)?))
            .map_err(|e| trap(KernelExport::Scale, &e))
    }

    /// Row-major `out[m x n] = a[m x k] * b[k x n]`.
    pub fn matmul_f64(
        &mut self,
        a: u32,
        b: u32,
        out: u32,
        m: usize,
        k: usize,
        n: usize,
    ) -> WasmResult<()> {
        self.exports
            .matmul
            .call(
                &mut self.store,
                (ptr(a), ptr(b), ptr(out), count(m)?, count(k)?, count(n)?),
            )
            .map_err(|e| trap(KernelExport::MatMul, &e))
    }

    /// Row-major `out[cols x rows] = transpose(a[rows x cols])`.
    pub fn transpose_f64(&mut self, a: u32, out: u32, rows: usize, cols: usize) -> WasmResult<()> {
        self.exports
            .transpose
            .call(&mut self.store, (ptr(a), ptr(out), count(rows)?, count(cols)?))
            .map_err(|e| trap(KernelExport::Transpose, &e))
    }

    /// A pseudo-random value in `[0, 1)`, if the module exports `rand_f64`.
    pub fn rand_f64(&mut self) -> Option<WasmResult<f64>> {
        let func = self.exports.rand.as_ref()?;
        Some(
            func.call(&mut self.store, ())
                .map_err(|e| WasmError::Trap {
                    kernel: "rand_f64",
                    message: e.to_string(),
                }),
        )
    }
}

impl ForeignAllocator for AcceleratedInstance {
    fn allocate(&mut self, size: usize, tag: TypeTag) -> AllocResult<u32> {
        if size > MAX_BLOCK {
            return Err(AllocError::TooLarge { requested: size });
        }
        let size_arg = i32::try_from(size).map_err(|_| AllocError::TooLarge { requested: size })?;
        let class = i32::try_from(tag.class_id()).unwrap_or(0);

        self.store.data_mut().abort = None;
        match self.exports.new.call(&mut self.store, (size_arg, class)) {
            Ok(p) => Ok(offset(p)),
            Err(err) => match self.store.data().abort {
                Some(_) => Err(AllocError::OutOfMemory { requested: size }),
                None => Err(AllocError::Runtime(err.to_string())),
            },
        }
    }

    fn pin(&mut self, offset: u32) -> AllocResult<()> {
        self.exports
            .pin
            .call(&mut self.store, ptr(offset))
            .map(|_| ())
            .map_err(|e| AllocError::PinFailed {
                offset,
                message: e.to_string(),
            })
    }

    fn unpin(&mut self, offset: u32) {
        if let Err(err) = self.exports.unpin.call(&mut self.store, ptr(offset)) {
            tracing::warn!(offset, error = %err, "wasm: __unpin trapped");
        }
    }

    fn collect(&mut self) {
        if let Err(err) = self.exports.collect.call(&mut self.store, ()) {
            tracing::warn!(error = %err, "wasm: __collect trapped");
        }
    }
}

impl fmt::Debug for AcceleratedInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcceleratedInstance")
            .field("memory_size", &self.memory_size())
            .field("last_abort", &self.last_abort())
            .finish_non_exhaustive()
    }
}

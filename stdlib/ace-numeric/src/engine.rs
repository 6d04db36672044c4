//! The execution orchestrator.

use crate::chunk::{MapOp, MapTask, ReduceOp, ReduceTask};
use crate::config::EngineConfig;
use crate::scalar::{PureScalar, ScalarKernels};
use crate::shared::{Operands, SharedRegion};
use crate::{EngineError, EngineResult};
use ace_dispatch::{
    Capabilities, Category, Dispatcher, ExecutionPlan, Strategy, Workload,
};
use ace_rts_arena::{
    with_scope, AllocStats, ArenaConfig, ArenaScope, MemoryArena, TagStats, TypeTag,
};
use ace_rts_pool::{PoolMetrics, PoolStats, Termination, WorkerPool};
use ace_wasm::{AcceleratedInstance, BinaryOp, ModuleLoader};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Call options and shapes
// ============================================================================

/// Per-call overrides of strategy selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Use this strategy instead of selecting one. Still degrades to Scalar
    /// when the capability it needs is missing.
    pub force: Option<Strategy>,
    /// Size compared against the thresholds instead of the real one.
    pub size_hint: Option<usize>,
}

impl ExecOptions {
    /// Select the strategy from the real input size.
    pub const AUTO: Self = Self {
        force: None,
        size_hint: None,
    };

    /// Force `strategy`.
    #[must_use]
    pub const fn forced(strategy: Strategy) -> Self {
        Self {
            force: Some(strategy),
            size_hint: None,
        }
    }

    /// Select as if the input had `size` elements.
    #[must_use]
    pub const fn sized(size: usize) -> Self {
        Self {
            force: None,
            size_hint: Some(size),
        }
    }
}

/// Dimensions of a row-major matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Shape {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
}

impl Shape {
    /// A `rows x cols` shape.
    #[must_use]
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of elements, saturating at `usize::MAX`.
    #[must_use]
    pub const fn len(self) -> usize {
        self.rows.saturating_mul(self.cols)
    }

    /// Number of elements, or `None` if it does not fit in `usize`.
    #[must_use]
    pub const fn checked_len(self) -> Option<usize> {
        self.rows.checked_mul(self.cols)
    }

    /// Whether the shape has no elements.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.rows == 0 || self.cols == 0
    }

    /// Validate `data` against the shape and return its element count.
    fn check(self, op: &'static str, name: &str, data: &[f64]) -> EngineResult<usize> {
        match self.checked_len() {
            Some(len) if len == data.len() => Ok(len),
            Some(_) => Err(EngineError::ShapeMismatch {
                op,
                detail: format!("{name} is {self} but holds {} values", data.len()),
            }),
            None => Err(EngineError::ShapeMismatch {
                op,
                detail: format!("{name} is {self}, which overflows"),
            }),
        }
    }
}

/// Length of an `f64` buffer of `rows x cols` values, if it can be allocated.
fn result_len(op: &'static str, rows: usize, cols: usize) -> EngineResult<usize> {
    rows.checked_mul(cols)
        .filter(|&len| len <= isize::MAX as usize / std::mem::size_of::<f64>())
        .ok_or_else(|| EngineError::ShapeMismatch {
            op,
            detail: format!("a {rows}x{cols} result is too large"),
        })
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.rows, self.cols)
    }
}

/// Divisor used by [`Engine::variance`] and [`Engine::std`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Normalization {
    /// Divide by `n - 1`.
    #[default]
    Unbiased,
    /// Divide by `n`.
    Uncorrected,
    /// Divide by `n + 1`.
    Biased,
}

impl Normalization {
    /// The divisor for `n` values.
    #[must_use]
    pub fn divisor(self, n: usize) -> f64 {
        let n = n as f64;
        match self {
            Self::Unbiased => n - 1.0,
            Self::Uncorrected => n,
            Self::Biased => n + 1.0,
        }
    }
}

impl std::str::FromStr for Normalization {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "unbiased" => Ok(Self::Unbiased),
            "uncorrected" => Ok(Self::Uncorrected),
            "biased" => Ok(Self::Biased),
            _ => Err(EngineError::Config(format!("unknown normalization `{s}`"))),
        }
    }
}

// ============================================================================
// Accelerated state
// ============================================================================

struct AccelContext {
    instance: AcceleratedInstance,
    arena: MemoryArena,
}

enum AccelSlot {
    /// Compiled, not yet instantiated.
    Pending,
    Ready(AccelContext),
    Unavailable,
}

struct Accel {
    loader: ModuleLoader,
    arena_config: ArenaConfig,
    slot: Mutex<AccelSlot>,
}

impl Accel {
    fn available(&self) -> bool {
        !matches!(*self.slot.lock(), AccelSlot::Unavailable)
    }
}

type Scope<'a> = ArenaScope<'a, AcceleratedInstance>;

fn stage(scope: &mut Scope<'_>, data: &[f64]) -> EngineResult<u32> {
    let offset = scope.allocate(std::mem::size_of_val(data), TypeTag::F64Array)?;
    scope.foreign().write_f64(offset, data)?;
    Ok(offset)
}

fn reserve(scope: &mut Scope<'_>, len: usize) -> EngineResult<u32> {
    Ok(scope.allocate(len * std::mem::size_of::<f64>(), TypeTag::F64Array)?)
}

fn fetch(scope: &mut Scope<'_>, offset: u32, len: usize) -> EngineResult<Vec<f64>> {
    Ok(scope.foreign().read_f64(offset, len)?)
}

// ============================================================================
// Engine
// ============================================================================

/// Runs numeric kernels with the strategy that suits each call.
///
/// The engine owns its worker pool and its accelerated instance; share it by
/// reference. All operations are `async`: the Parallel strategy awaits its
/// chunk tasks without blocking the calling thread, the other strategies
/// complete synchronously.
pub struct Engine {
    dispatcher: Dispatcher,
    pool: Option<WorkerPool>,
    accel: Option<Accel>,
    scalar: Arc<dyn ScalarKernels>,
}

impl Engine {
    /// Build an engine with the pure scalar kernels.
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        Self::with_scalar(config, Arc::new(PureScalar))
    }

    /// Build an engine around a custom scalar kernel provider.
    ///
    /// `pool.max_workers == 0` disables the Parallel strategy;
    /// `accelerated.enabled == false` disables the Accelerated one.
    pub fn with_scalar(config: EngineConfig, scalar: Arc<dyn ScalarKernels>) -> EngineResult<Self> {
        let dispatcher = Dispatcher::with_overrides(&config.thresholds, &config.chunking)?;

        let pool = if config.pool.max_workers == 0 {
            None
        } else {
            Some(WorkerPool::new(config.pool.clone())?)
        };

        let accel = if config.accelerated.enabled {
            Self::prepare_accelerated(&config)
        } else {
            tracing::info!("engine: accelerated module disabled");
            None
        };

        let engine = Self {
            dispatcher,
            pool,
            accel,
            scalar,
        };
        let caps = engine.capabilities();
        tracing::info!(
            workers = engine.workers(),
            accelerated = caps.accelerated,
            parallel = caps.parallel,
            "engine: ready"
        );
        Ok(engine)
    }

    fn prepare_accelerated(config: &EngineConfig) -> Option<Accel> {
        let loader = match ModuleLoader::new(&config.accelerated.loader()) {
            Ok(loader) => loader,
            Err(err) => {
                tracing::warn!(error = %err, "engine: accelerated module unavailable");
                return None;
            }
        };
        let slot = match loader.precompile() {
            Ok(()) => AccelSlot::Pending,
            Err(err) => {
                tracing::warn!(error = %err, "engine: accelerated module unavailable");
                AccelSlot::Unavailable
            }
        };
        Some(Accel {
            loader,
            arena_config: config.accelerated.arena(),
            slot: Mutex::new(slot),
        })
    }

    // ========================================================================
    // Diagnostics
    // ========================================================================

    /// What this engine can currently run.
    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            accelerated: self.accel.as_ref().is_some_and(Accel::available),
            parallel: self.pool.is_some(),
        }
    }

    /// Worker slots available to the Parallel strategy (1 without a pool).
    #[must_use]
    pub fn workers(&self) -> usize {
        self.pool.as_ref().map_or(1, WorkerPool::max_workers)
    }

    /// The strategy and chunking a call of `size` in `category` would get,
    /// without running anything.
    ///
    /// Matrix categories assume square operands when only a size is known.
    #[must_use]
    pub fn execution_plan(&self, size: usize, category: Category) -> ExecutionPlan {
        self.dispatcher.plan(
            Workload::from_size(category, size),
            self.capabilities(),
            self.workers(),
            None,
        )
    }

    /// Worker pool occupancy, if the engine has a pool.
    #[must_use]
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(WorkerPool::stats)
    }

    /// Worker pool metrics, if the engine has a pool.
    #[must_use]
    pub fn metrics(&self) -> Option<PoolMetrics> {
        self.pool.as_ref().map(WorkerPool::metrics)
    }

    /// Arena usage per type tag; empty until the accelerated module is used.
    #[must_use]
    pub fn arena_stats(&self) -> BTreeMap<TypeTag, TagStats> {
        self.with_context(|cx| cx.arena.stats()).unwrap_or_default()
    }

    /// Arena allocation counters, once the accelerated module is in use.
    #[must_use]
    pub fn arena_counters(&self) -> Option<AllocStats> {
        self.with_context(|cx| cx.arena.counters())
    }

    /// Unpin every pooled arena block.
    pub fn reset_arena(&self) {
        self.with_context(|cx| cx.arena.reset(&mut cx.instance));
    }

    /// Shut the worker pool down. Later parallel calls fail with
    /// [`EngineError::PoolTerminated`].
    pub fn terminate(&self, force: bool, timeout: Option<Duration>) -> Option<Termination> {
        self.pool.as_ref().map(|pool| pool.terminate(force, timeout))
    }

    fn with_context<R>(&self, f: impl FnOnce(&mut AccelContext) -> R) -> Option<R> {
        let accel = self.accel.as_ref()?;
        let mut slot = accel.slot.lock();
        match &mut *slot {
            AccelSlot::Ready(cx) => Some(f(cx)),
            AccelSlot::Pending | AccelSlot::Unavailable => None,
        }
    }

    // ========================================================================
    // Dispatch helpers
    // ========================================================================

    fn plan(&self, op: &'static str, workload: Workload, opts: ExecOptions) -> ExecutionPlan {
        let mut selected = workload;
        if let Some(size) = opts.size_hint {
            selected.size = size;
        }
        let mut plan = self
            .dispatcher
            .plan(selected, self.capabilities(), self.workers(), opts.force);
        plan.workload = workload;
        tracing::debug!(
            op,
            size = workload.size,
            strategy = %plan.strategy,
            chunks = plan.chunk_count(),
            "engine: dispatch"
        );
        plan
    }

    /// Run `f` on the accelerated instance inside an arena scope.
    ///
    /// Returns `None` when the module is unavailable; the caller then falls
    /// back to the scalar kernels.
    fn accelerated<R>(
        &self,
        f: impl FnOnce(&mut Scope<'_>) -> EngineResult<R>,
    ) -> Option<EngineResult<R>> {
        let accel = self.accel.as_ref()?;
        let mut slot = accel.slot.lock();
        if matches!(*slot, AccelSlot::Pending) {
            *slot = match accel.loader.load() {
                Some(instance) => AccelSlot::Ready(AccelContext {
                    instance,
                    arena: MemoryArena::new(accel.arena_config),
                }),
                None => AccelSlot::Unavailable,
            };
        }
        let AccelSlot::Ready(cx) = &mut *slot else {
            return None;
        };
        Some(with_scope(&mut cx.arena, &mut cx.instance, f))
    }

    async fn reduce_parallel(
        &self,
        pool: &WorkerPool,
        op: ReduceOp,
        operands: &[&[f64]],
        plan: &ExecutionPlan,
    ) -> EngineResult<f64> {
        let operands = Operands::new(operands);
        let handles: Vec<_> = plan
            .chunks
            .iter()
            .map(|units| {
                let task = ReduceTask {
                    kernels: Arc::clone(&self.scalar),
                    operands: operands.clone(),
                    units: units.clone(),
                };
                pool.exec(op, task)
            })
            .collect();
        let mut total = 0.0;
        for partial in join_all(handles).await {
            total += partial?;
        }
        Ok(total)
    }

    /// Run an operation that writes `stride` result values per split unit.
    async fn map_parallel(
        &self,
        pool: &WorkerPool,
        name: &'static str,
        op: MapOp,
        region: SharedRegion,
        stride: usize,
        plan: &ExecutionPlan,
    ) -> EngineResult<Vec<f64>> {
        let ranges: Vec<_> = plan
            .chunks
            .iter()
            .map(|r| r.start * stride..r.end * stride)
            .collect();
        let (operands, outputs, collector) = region.split(&ranges)?;
        let handles: Vec<_> = plan
            .chunks
            .iter()
            .zip(outputs)
            .map(|(units, output)| {
                let task = MapTask {
                    kernels: Arc::clone(&self.scalar),
                    operands: operands.clone(),
                    units: units.clone(),
                    output,
                };
                pool.exec(op, task)
            })
            .collect();
        for settled in join_all(handles).await {
            settled?;
        }
        collector
            .finish()
            .ok_or(EngineError::Incomplete { op: name })
    }

    // ========================================================================
    // Element-wise operations
    // ========================================================================

    async fn binary(
        &self,
        name: &'static str,
        op: BinaryOp,
        a: &[f64],
        b: &[f64],
        opts: ExecOptions,
    ) -> EngineResult<Vec<f64>> {
        if a.len() != b.len() {
            return Err(EngineError::ShapeMismatch {
                op: name,
                detail: format!("lengths {} and {}", a.len(), b.len()),
            });
        }
        let n = a.len();
        let plan = self.plan(name, Workload::with_units(Category::ElementWise, n, n), opts);
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                let region = SharedRegion::new(&[a, b], n);
                self.map_parallel(pool, name, MapOp::Binary(op), region, 1, &plan)
                    .await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    let pb = stage(scope, b)?;
                    let out = reserve(scope, n)?;
                    scope.foreign().binary_f64(op, pa, pb, out, n)?;
                    fetch(scope, out, n)
                })
                .unwrap_or_else(|| Ok(self.binary_scalar(op, a, b))),
            _ => Ok(self.binary_scalar(op, a, b)),
        }
    }

    fn binary_scalar(&self, op: BinaryOp, a: &[f64], b: &[f64]) -> Vec<f64> {
        let mut out = vec![0.0; a.len()];
        self.scalar.binary(op, a, b, &mut out);
        out
    }

    /// `a + b`, element by element.
    pub async fn add(&self, a: &[f64], b: &[f64], opts: ExecOptions) -> EngineResult<Vec<f64>> {
        self.binary("add", BinaryOp::Add, a, b, opts).await
    }

    /// `a - b`, element by element.
    pub async fn subtract(&self, a: &[f64], b: &[f64], opts: ExecOptions) -> EngineResult<Vec<f64>> {
        self.binary("subtract", BinaryOp::Sub, a, b, opts).await
    }

    /// `a * b`, element by element.
    pub async fn multiply_elementwise(
        &self,
        a: &[f64],
        b: &[f64],
        opts: ExecOptions,
    ) -> EngineResult<Vec<f64>> {
        self.binary("multiply_elementwise", BinaryOp::Mul, a, b, opts)
            .await
    }

    /// `a * s`, element by element.
    pub async fn scale(&self, a: &[f64], s: f64, opts: ExecOptions) -> EngineResult<Vec<f64>> {
        let n = a.len();
        let plan = self.plan("scale", Workload::with_units(Category::ElementWise, n, n), opts);
        let scalar = || {
            let mut out = vec![0.0; n];
            self.scalar.scale(a, s, &mut out);
            out
        };
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                let region = SharedRegion::new(&[a], n);
                self.map_parallel(pool, "scale", MapOp::Scale(s), region, 1, &plan)
                    .await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    let out = reserve(scope, n)?;
                    scope.foreign().scale_f64(pa, s, out, n)?;
                    fetch(scope, out, n)
                })
                .unwrap_or_else(|| Ok(scalar())),
            _ => Ok(scalar()),
        }
    }

    // ========================================================================
    // Matrix operations
    // ========================================================================

    /// Row-major matrix product of `a` and `b`.
    pub async fn multiply(
        &self,
        a: &[f64],
        a_shape: Shape,
        b: &[f64],
        b_shape: Shape,
        opts: ExecOptions,
    ) -> EngineResult<Vec<f64>> {
        a_shape.check("multiply", "left operand", a)?;
        b_shape.check("multiply", "right operand", b)?;
        if a_shape.cols != b_shape.rows {
            return Err(EngineError::ShapeMismatch {
                op: "multiply",
                detail: format!("cannot multiply {a_shape} by {b_shape}"),
            });
        }
        let (m, k, n) = (a_shape.rows, a_shape.cols, b_shape.cols);
        let len = result_len("multiply", m, n)?;
        let plan = self.plan(
            "multiply",
            Workload::with_units(Category::MatrixMultiply, m.saturating_mul(k).saturating_mul(n), m),
            opts,
        );
        let scalar = || {
            let mut out = vec![0.0; len];
            self.scalar.matmul_rows(a, b, k, n, 0..m, &mut out);
            out
        };
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                let region = SharedRegion::new(&[a, b], len);
                self.map_parallel(pool, "multiply", MapOp::MatMul { k, n }, region, n, &plan)
                    .await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    let pb = stage(scope, b)?;
                    let out = reserve(scope, len)?;
                    scope.foreign().matmul_f64(pa, pb, out, m, k, n)?;
                    fetch(scope, out, len)
                })
                .unwrap_or_else(|| Ok(scalar())),
            _ => Ok(scalar()),
        }
    }

    /// Transpose of row-major `a`; the result is `shape.cols x shape.rows`.
    pub async fn transpose(&self, a: &[f64], shape: Shape, opts: ExecOptions) -> EngineResult<Vec<f64>> {
        let len = shape.check("transpose", "operand", a)?;
        let (rows, cols) = (shape.rows, shape.cols);
        let plan = self.plan(
            "transpose",
            Workload::with_units(Category::Transpose, len, cols),
            opts,
        );
        let scalar = || {
            let mut out = vec![0.0; len];
            self.scalar.transpose_rows(a, rows, cols, 0..cols, &mut out);
            out
        };
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                let region = SharedRegion::new(&[a], len);
                let op = MapOp::Transpose { rows, cols };
                self.map_parallel(pool, "transpose", op, region, rows, &plan)
                    .await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    let out = reserve(scope, len)?;
                    scope.foreign().transpose_f64(pa, out, rows, cols)?;
                    fetch(scope, out, len)
                })
                .unwrap_or_else(|| Ok(scalar())),
            _ => Ok(scalar()),
        }
    }

    // ========================================================================
    // Reductions
    // ========================================================================

    /// Inner product of `a` and `b`.
    pub async fn dot_product(&self, a: &[f64], b: &[f64], opts: ExecOptions) -> EngineResult<f64> {
        if a.len() != b.len() {
            return Err(EngineError::ShapeMismatch {
                op: "dot_product",
                detail: format!("lengths {} and {}", a.len(), b.len()),
            });
        }
        let n = a.len();
        let plan = self.plan("dot_product", Workload::with_units(Category::DotProduct, n, n), opts);
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                self.reduce_parallel(pool, ReduceOp::Dot, &[a, b], &plan).await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    let pb = stage(scope, b)?;
                    Ok(scope.foreign().dot_f64(pa, pb, n)?)
                })
                .unwrap_or_else(|| Ok(self.scalar.dot(a, b))),
            _ => Ok(self.scalar.dot(a, b)),
        }
    }

    /// Sum of `a`.
    ///
    /// Parallel partial sums are added in chunk order, so the result can
    /// differ from the scalar sum in the last bits.
    pub async fn sum(&self, a: &[f64], opts: ExecOptions) -> EngineResult<f64> {
        let n = a.len();
        let plan = self.plan("sum", Workload::with_units(Category::Reduction, n, n), opts);
        match (plan.strategy, &self.pool) {
            (Strategy::Parallel, Some(pool)) => {
                self.reduce_parallel(pool, ReduceOp::Sum, &[a], &plan).await
            }
            (Strategy::Accelerated, _) => self
                .accelerated(|scope| {
                    let pa = stage(scope, a)?;
                    Ok(scope.foreign().sum_f64(pa, n)?)
                })
                .unwrap_or_else(|| Ok(self.scalar.sum(a))),
            _ => Ok(self.scalar.sum(a)),
        }
    }

    /// Arithmetic mean: always [`Engine::sum`] divided by the length.
    pub async fn mean(&self, a: &[f64], opts: ExecOptions) -> EngineResult<f64> {
        if a.is_empty() {
            return Err(EngineError::EmptyInput { op: "mean" });
        }
        Ok(self.sum(a, opts).await? / a.len() as f64)
    }

    /// Variance around [`Engine::mean`].
    ///
    /// The mean follows the selected strategy; the squared deviations are
    /// then accumulated in one sequential pass. One value with
    /// [`Normalization::Unbiased`] gives NaN.
    pub async fn variance(
        &self,
        a: &[f64],
        normalization: Normalization,
        opts: ExecOptions,
    ) -> EngineResult<f64> {
        if a.is_empty() {
            return Err(EngineError::EmptyInput { op: "variance" });
        }
        let mean = self.mean(a, opts).await?;
        let squares: f64 = a.iter().map(|x| (x - mean) * (x - mean)).sum();
        Ok(squares / normalization.divisor(a.len()))
    }

    /// Standard deviation: the square root of [`Engine::variance`].
    pub async fn std(
        &self,
        a: &[f64],
        normalization: Normalization,
        opts: ExecOptions,
    ) -> EngineResult<f64> {
        if a.is_empty() {
            return Err(EngineError::EmptyInput { op: "std" });
        }
        Ok(self.variance(a, normalization, opts).await?.sqrt())
    }
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("capabilities", &self.capabilities())
            .field("workers", &self.workers())
            .finish_non_exhaustive()
    }
}

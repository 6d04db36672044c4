//! End-to-end behavior of the engine under every strategy.

use ace_dispatch::{ChunkOverride, Strategy};
use ace_numeric::{
    Category, Engine, EngineConfig, EngineError, ExecOptions, Normalization, PureScalar,
    ScalarKernels, Shape,
};
use ace_rts_arena::{AllocError, TypeTag};
use ace_wasm::BinaryOp;
use futures::executor::block_on;
use std::ops::Range;
use std::sync::Arc;

const A: [f64; 4] = [1.0, 2.0, 3.0, 4.0];
const B: [f64; 4] = [5.0, 6.0, 7.0, 8.0];
const AB: [f64; 4] = [19.0, 22.0, 43.0, 50.0];

fn config(workers: usize, accelerated: bool) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.pool.max_workers = workers;
    config.accelerated.enabled = accelerated;
    config
}

fn engine(workers: usize, accelerated: bool) -> Engine {
    Engine::new(config(workers, accelerated)).unwrap()
}

/// Deterministic values in `[0, 1)`.
fn values(n: usize, seed: u64) -> Vec<f64> {
    let mut state = seed | 1;
    (0..n)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 11) as f64 / (1u64 << 53) as f64
        })
        .collect()
}

const STRATEGIES: [Strategy; 3] = [Strategy::Scalar, Strategy::Accelerated, Strategy::Parallel];

// ============================================================================
// Concrete scenarios
// ============================================================================

#[test]
fn test_matmul_2x2_scalar() {
    let engine = engine(2, false);
    let c = block_on(engine.multiply(&A, Shape::new(2, 2), &B, Shape::new(2, 2), ExecOptions::AUTO));
    assert_eq!(c.unwrap(), AB.to_vec());
}

#[test]
fn test_matmul_2x2_forced_parallel_two_workers() {
    let engine = engine(2, false);
    let opts = ExecOptions::forced(Strategy::Parallel);
    let c = block_on(engine.multiply(&A, Shape::new(2, 2), &B, Shape::new(2, 2), opts));
    assert_eq!(c.unwrap(), AB.to_vec());
}

#[test]
fn test_matmul_2x2_parallel_by_size_override() {
    let engine = engine(2, false);
    let c = block_on(engine.multiply(
        &A,
        Shape::new(2, 2),
        &B,
        Shape::new(2, 2),
        ExecOptions::sized(10_000_000),
    ));
    assert_eq!(c.unwrap(), AB.to_vec());
}

#[test]
fn test_matmul_2x2_accelerated() {
    let engine = engine(2, true);
    let c = block_on(engine.multiply(
        &A,
        Shape::new(2, 2),
        &B,
        Shape::new(2, 2),
        ExecOptions::forced(Strategy::Accelerated),
    ));
    assert_eq!(c.unwrap(), AB.to_vec());
    assert!(engine.arena_counters().unwrap().fresh_allocations >= 3);
}

#[test]
fn test_dot_product_is_32_under_every_strategy() {
    let engine = engine(2, true);
    for strategy in STRATEGIES {
        let dot = block_on(engine.dot_product(
            &[1.0, 2.0, 3.0],
            &[4.0, 5.0, 6.0],
            ExecOptions::forced(strategy),
        ));
        assert_eq!(dot.unwrap(), 32.0, "{strategy}");
    }
}

#[test]
fn test_rectangular_matmul_all_strategies_agree() {
    let engine = engine(3, true);
    let a = values(5 * 7, 11);
    let b = values(7 * 4, 12);
    let mut expected = vec![0.0; 5 * 4];
    PureScalar.matmul_rows(&a, &b, 7, 4, 0..5, &mut expected);
    for strategy in STRATEGIES {
        let c = block_on(engine.multiply(
            &a,
            Shape::new(5, 7),
            &b,
            Shape::new(7, 4),
            ExecOptions::forced(strategy),
        ))
        .unwrap();
        assert_eq!(c, expected, "{strategy}");
    }
}

#[test]
fn test_transpose_all_strategies_agree() {
    let mut config = config(4, true);
    config.chunking.transpose = Some(ChunkOverride {
        min_batch: Some(1),
        max_batches: None,
    });
    let engine = Engine::new(config).unwrap();
    let a: Vec<f64> = (0..12).map(f64::from).collect();
    let expected = vec![0.0, 4.0, 8.0, 1.0, 5.0, 9.0, 2.0, 6.0, 10.0, 3.0, 7.0, 11.0];
    for strategy in STRATEGIES {
        let t = block_on(engine.transpose(&a, Shape::new(3, 4), ExecOptions::forced(strategy)));
        assert_eq!(t.unwrap(), expected, "{strategy}");
    }
}

#[test]
fn test_elementwise_all_strategies_agree() {
    let engine = engine(4, true);
    let a = values(50_000, 1);
    let b = values(50_000, 2);
    let scalar_add = block_on(engine.add(&a, &b, ExecOptions::forced(Strategy::Scalar))).unwrap();
    let scalar_sub = block_on(engine.subtract(&a, &b, ExecOptions::forced(Strategy::Scalar))).unwrap();
    let scalar_mul =
        block_on(engine.multiply_elementwise(&a, &b, ExecOptions::forced(Strategy::Scalar))).unwrap();
    let scalar_scale = block_on(engine.scale(&a, 0.5, ExecOptions::forced(Strategy::Scalar))).unwrap();

    for strategy in [Strategy::Accelerated, Strategy::Parallel] {
        let opts = ExecOptions::forced(strategy);
        assert_eq!(block_on(engine.add(&a, &b, opts)).unwrap(), scalar_add);
        assert_eq!(block_on(engine.subtract(&a, &b, opts)).unwrap(), scalar_sub);
        assert_eq!(block_on(engine.multiply_elementwise(&a, &b, opts)).unwrap(), scalar_mul);
        assert_eq!(block_on(engine.scale(&a, 0.5, opts)).unwrap(), scalar_scale);
    }
}

#[test]
fn test_reductions_approximately_equal() {
    let engine = engine(4, true);
    for n in [10, 10_000, 1_000_000] {
        let a = values(n, n as u64);
        let b = values(n, n as u64 + 1);
        let scalar_sum = block_on(engine.sum(&a, ExecOptions::forced(Strategy::Scalar))).unwrap();
        let scalar_dot =
            block_on(engine.dot_product(&a, &b, ExecOptions::forced(Strategy::Scalar))).unwrap();
        let eps = 1e-12 * n as f64;
        for strategy in [Strategy::Accelerated, Strategy::Parallel] {
            let opts = ExecOptions::forced(strategy);
            let sum = block_on(engine.sum(&a, opts)).unwrap();
            let dot = block_on(engine.dot_product(&a, &b, opts)).unwrap();
            assert!((sum - scalar_sum).abs() <= eps, "{strategy} sum n={n}");
            assert!((dot - scalar_dot).abs() <= eps, "{strategy} dot n={n}");
        }
    }
}

#[test]
fn test_mean_is_sum_over_length() {
    let engine = engine(4, true);
    let a = values(300_000, 9);
    for strategy in STRATEGIES {
        let opts = ExecOptions::forced(strategy);
        let sum = block_on(engine.sum(&a, opts)).unwrap();
        let mean = block_on(engine.mean(&a, opts)).unwrap();
        assert_eq!(mean, sum / a.len() as f64, "{strategy}");
    }
}

#[test]
fn test_variance_after_parallel_mean() {
    let engine = engine(4, false);
    let a = values(200_000, 5);
    let scalar = block_on(engine.variance(&a, Normalization::Unbiased, ExecOptions::forced(Strategy::Scalar)));
    let parallel = block_on(engine.variance(&a, Normalization::Unbiased, ExecOptions::AUTO));
    assert!((scalar.unwrap() - parallel.unwrap()).abs() < 1e-9);
    let std = block_on(engine.std(&a, Normalization::Unbiased, ExecOptions::AUTO)).unwrap();
    // Uniform on [0, 1): variance 1/12.
    assert!((std * std - 1.0 / 12.0).abs() < 1e-2);
}

// ============================================================================
// Strategy selection
// ============================================================================

#[test]
fn test_execution_plan_without_running() {
    let engine = engine(4, false);
    let small = engine.execution_plan(500, Category::Reduction);
    assert_eq!(small.strategy, Strategy::Scalar);
    assert_eq!(small.workers, 1);

    // Accelerated is disabled, so mid-sized input stays scalar.
    assert_eq!(
        engine.execution_plan(5_000, Category::Reduction).strategy,
        Strategy::Scalar
    );

    let large = engine.execution_plan(1_000_000, Category::Reduction);
    assert_eq!(large.strategy, Strategy::Parallel);
    assert_eq!(large.workers, 4);
    assert_eq!(large.chunk_count(), 4);
    assert_eq!(engine.metrics().unwrap().tasks_executed, 0);
}

#[test]
fn test_execution_plan_with_accelerated() {
    let engine = engine(4, true);
    assert_eq!(
        engine.execution_plan(5_000, Category::DotProduct).strategy,
        Strategy::Accelerated
    );
}

#[test]
fn test_threshold_overrides_from_config() {
    let config = EngineConfig::from_toml_str(
        r#"
        [pool]
        max_workers = 2

        [accelerated]
        enabled = false

        [thresholds.reduction]
        accelerated = 1
        parallel = 2
        "#,
    )
    .unwrap();
    let engine = Engine::new(config).unwrap();
    assert_eq!(
        engine.execution_plan(2, Category::Reduction).strategy,
        Strategy::Parallel
    );
}

#[test]
fn test_invalid_thresholds_rejected() {
    let config = EngineConfig::from_toml_str(
        r#"
        [thresholds.transpose]
        accelerated = 500
        parallel = 100
        "#,
    )
    .unwrap();
    assert!(matches!(Engine::new(config), Err(EngineError::Config(_))));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_missing_module_falls_back_to_scalar() {
    let mut config = config(2, true);
    config.accelerated.module_path = Some("/no/such/kernels.wasm".into());
    let engine = Engine::new(config).unwrap();
    assert!(!engine.capabilities().accelerated);
    let sum = block_on(engine.sum(&[1.0, 2.0, 3.0], ExecOptions::forced(Strategy::Accelerated)));
    assert_eq!(sum.unwrap(), 6.0);
    assert!(engine.arena_counters().is_none());
}

#[test]
fn test_out_of_linear_memory_is_allocation_failure() {
    let mut config = config(2, true);
    config.accelerated.max_memory_pages = 2;
    let engine = Engine::new(config).unwrap();
    let big = vec![1.0; 100_000];
    let err = block_on(engine.sum(&big, ExecOptions::forced(Strategy::Accelerated))).unwrap_err();
    assert!(matches!(
        err,
        EngineError::AllocationFailure(AllocError::OutOfMemory { .. })
    ));

    // Nothing leaked and the module is still usable.
    let stats = engine.arena_stats();
    assert_eq!(stats.get(&TypeTag::F64Array).map_or(0, |s| s.in_use_count), 0);
    let sum = block_on(engine.sum(&[1.0, 2.0], ExecOptions::forced(Strategy::Accelerated)));
    assert_eq!(sum.unwrap(), 3.0);
}

#[test]
fn test_arena_reuses_across_calls() {
    let engine = engine(2, true);
    let a = values(1_000, 3);
    for _ in 0..5 {
        block_on(engine.sum(&a, ExecOptions::forced(Strategy::Accelerated))).unwrap();
    }
    let counters = engine.arena_counters().unwrap();
    assert_eq!(counters.fresh_allocations, 1);
    assert_eq!(counters.reuses, 4);
    let stats = engine.arena_stats();
    assert_eq!(stats[&TypeTag::F64Array].count, 1);
    assert_eq!(stats[&TypeTag::F64Array].in_use_count, 0);

    engine.reset_arena();
    assert!(engine.arena_stats().is_empty());
}

#[test]
fn test_terminated_pool_surfaces_to_parallel_calls() {
    let engine = engine(2, false);
    let termination = engine.terminate(false, None).unwrap();
    assert!(termination.drained);
    let err = block_on(engine.sum(&[1.0; 8], ExecOptions::forced(Strategy::Parallel))).unwrap_err();
    assert_eq!(err, EngineError::PoolTerminated);
    // Scalar work is unaffected.
    assert_eq!(block_on(engine.sum(&[1.0; 8], ExecOptions::AUTO)).unwrap(), 8.0);
}

struct PanickingSum;

impl ScalarKernels for PanickingSum {
    fn sum(&self, _: &[f64]) -> f64 {
        panic!("sum kernel exploded")
    }
    fn dot(&self, x: &[f64], y: &[f64]) -> f64 {
        PureScalar.dot(x, y)
    }
    fn binary(&self, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) {
        PureScalar.binary(op, a, b, out);
    }
    fn scale(&self, a: &[f64], s: f64, out: &mut [f64]) {
        PureScalar.scale(a, s, out);
    }
    fn matmul_rows(
        &self,
        a: &[f64],
        b: &[f64],
        k: usize,
        n: usize,
        rows: Range<usize>,
        out: &mut [f64],
    ) {
        PureScalar.matmul_rows(a, b, k, n, rows, out);
    }
    fn transpose_rows(
        &self,
        a: &[f64],
        r: usize,
        c: usize,
        rows: Range<usize>,
        out: &mut [f64],
    ) {
        PureScalar.transpose_rows(a, r, c, rows, out);
    }
}

#[test]
fn test_kernel_panic_in_worker_is_isolated() {
    let engine = Engine::with_scalar(config(2, false), Arc::new(PanickingSum)).unwrap();
    let err = block_on(engine.sum(&[1.0; 4], ExecOptions::forced(Strategy::Parallel))).unwrap_err();
    assert_eq!(
        err,
        EngineError::TaskPanicked {
            message: "sum kernel exploded".to_string(),
        }
    );
    // The pool keeps working.
    let dot = block_on(engine.dot_product(&[1.0], &[2.0], ExecOptions::forced(Strategy::Parallel)));
    assert_eq!(dot.unwrap(), 2.0);
}

use cf_control::{ExecutionContext, StepFn, make_while};
use cf_core::{BatchAxes, Operand, Value};
use cf_lax::{Primitive, eval_binary};
use cf_transforms::{LoopAndStackMapper, SpecializingCompiler};
use criterion::{Criterion, criterion_group, criterion_main};
use std::sync::Arc;

fn count_to_ten() -> (StepFn, StepFn) {
    let cond = StepFn::pure("below_ten", |args: &[Value]| {
        Ok(vec![eval_binary(
            Primitive::Lt,
            &args[0],
            &Value::scalar_i64(10),
        )?])
    });
    let body = StepFn::pure("increment", |args: &[Value]| {
        Ok(vec![eval_binary(
            Primitive::Add,
            &args[0],
            &Value::scalar_i64(1),
        )?])
    });
    (cond, body)
}

fn benchmark_loops(c: &mut Criterion) {
    let (cond, body) = count_to_ten();
    let tracer = make_while(cond, body, None).expect("tracer should build");

    c.bench_function("while/eager_scalar", |b| {
        b.iter(|| {
            let out = tracer
                .while_loop(
                    &ExecutionContext::Eager,
                    vec![Operand::plain(Value::scalar_i64(0))],
                )
                .expect("eager loop should succeed");
            assert_eq!(out[0].value, Value::scalar_i64(10));
        });
    });

    let trace = ExecutionContext::trace(Arc::new(SpecializingCompiler::new()));
    c.bench_function("while/trace_scalar_cached", |b| {
        b.iter(|| {
            let out = tracer
                .while_loop(&trace, vec![Operand::plain(Value::scalar_i64(0))])
                .expect("traced loop should succeed");
            assert_eq!(out[0].value, Value::scalar_i64(10));
        });
    });

    let batched = ExecutionContext::batched(
        Arc::new(SpecializingCompiler::new()),
        Arc::new(LoopAndStackMapper::new()),
    );
    let lanes: Vec<i64> = (0..32).map(|lane| lane % 10).collect();
    c.bench_function("while/batched_32_lanes", |b| {
        b.iter(|| {
            let operand = Operand::batched(
                Value::vector_i64(&lanes).expect("lanes should stack"),
                BatchAxes::single(0),
            );
            tracer
                .while_loop(&batched, vec![operand])
                .expect("batched loop should succeed")
        });
    });
}

criterion_group!(loop_benches, benchmark_loops);
criterion_main!(loop_benches);

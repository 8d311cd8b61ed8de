#![cfg(test)]
//! Integration tests for the full pass pipeline.
//!
//! Each test builds a program, runs it through simplification and
//! allocation expansion, and checks that the reference evaluator gives the
//! same results before and after.

use crate::eval::Value;
use crate::expand_allocations::ExpandConfig;
use crate::ir::{
    BinOp, Body, Certs, ChunkedMapKernel, Exp, IxFun, KernelOp, NameSource, PatElem, Pattern, PrimExp, Prog, Space,
    Stm, StreamOrd, Type,
};
use crate::simplify::SimplifyConfig;
use crate::test_support::*;
use crate::{Expanded, Pipeline};

fn compile(prog: Prog, names: NameSource) -> Expanded {
    Pipeline::new(prog, names)
        .simplify(&SimplifyConfig::default())
        .expect("simplification failed")
        .expand_allocations(&ExpandConfig::default())
        .expect("allocation expansion failed")
}

fn has_alloc(body: &Body) -> bool {
    body.stms.iter().any(|s| matches!(s.exp, Exp::Alloc { .. }))
}

/// `main(n, t, bytes, xs, zs)`: each thread fills a scratch block with
/// `iota(n, x, 1)` and returns its last element plus `bytes * 2`. The `zs`
/// input is never read.
fn scratch_prog(names: &mut NameSource, variant: bool) -> Prog {
    let n = names.fresh("n");
    let t = names.fresh("t");
    let bytes = names.fresh("bytes");
    let xs = names.fresh("xs");
    let zs = names.fresh("zs");
    let tid = names.fresh("tid");
    let i = names.fresh("i");
    let x = names.fresh("x");
    let z = names.fresh("z");
    let k = names.fresh("k");
    let size = names.fresh("size");
    let mem = names.fresh("mem");
    let buf = names.fresh("buf");
    let last = names.fresh("last");
    let e = names.fresh("e");
    let r = names.fresh("r");
    let ys = names.fresh("ys");

    let mut stms = vec![let_i64(&k, binop(BinOp::Mul, var(&bytes), c(2)))];
    let block_size = if variant {
        stms.push(let_i64(&size, binop(BinOp::Mul, var(&x), c(8))));
        var(&size)
    } else {
        var(&bytes)
    };
    stms.push(Stm::single(
        mem.clone(),
        Type::mem(block_size.clone(), Space::Default),
        Exp::Alloc {
            size: block_size,
            space: Space::Default,
        },
    ));
    stms.push(Stm::new(
        Pattern::new(vec![
            PatElem::new(buf.clone(), i64_array(var(&n))).in_mem(mem, IxFun::iota(vec![PrimExp::var(&n)]))
        ]),
        Exp::Iota {
            n: var(&n),
            start: var(&x),
            stride: c(1),
        },
    ));
    stms.push(let_i64(&last, binop(BinOp::Sub, var(&n), c(1))));
    stms.push(let_i64(
        &e,
        Exp::Index {
            arr: buf,
            indices: vec![var(&last)],
        },
    ));
    stms.push(let_i64(&r, binop(BinOp::Add, var(&e), var(&k))));

    let kernel = map_1d(
        var(&t),
        &tid,
        &i,
        vec![
            input(&x, i64_t(), &xs, vec![var(&i)]),
            input(&z, i64_t(), &zs, vec![var(&i)]),
        ],
        vec![i64_t()],
        Body::new(stms, vec![var(&r)]),
    );
    main_prog(
        vec![
            param(&n, i64_t()),
            param(&t, i64_t()),
            param(&bytes, i64_t()),
            param(&xs, i64_array(var(&t))),
            param(&zs, i64_array(var(&t))),
        ],
        vec![i64_array(var(&t))],
        Body::new(vec![Stm::single(ys.clone(), i64_array(var(&t)), kernel)], vec![var(&ys)]),
    )
}

fn scratch_args(t: i64) -> Vec<Value> {
    let xs: Vec<i64> = (1..=t).collect();
    let zs: Vec<i64> = vec![0; t as usize];
    vec![
        Value::i64(2),
        Value::i64(t),
        Value::i64(4),
        Value::i64_array(&xs),
        Value::i64_array(&zs),
    ]
}

// =============================================================================
// Map kernels
// =============================================================================

#[test]
fn test_pipeline_expands_scratch_memory() {
    init_logging();
    let mut names = NameSource::new();
    let prog = scratch_prog(&mut names, false);
    let expanded = compile(prog.clone(), names);
    assert!(!expanded.has_diagnostics());

    let top = main_body(&expanded.prog);
    assert!(has_alloc(top));
    match kernels(top).as_slice() {
        [KernelOp::MapKernel(k)] => {
            assert_eq!(k.inputs.len(), 1, "unused input survived");
            assert!(!has_alloc(&k.body));
            // `bytes * 2` and `n - 1` do not depend on the thread.
            assert_eq!(k.body.stms.len(), 3);
        }
        other => panic!("expected one map kernel, got {:?}", other),
    }

    assert_eq!(run(&expanded.prog, scratch_args(3)), vec![Value::i64_array(&[10, 11, 12])]);
    for t in [0, 1, 3, 5] {
        assert_eq!(run(&prog, scratch_args(t)), run(&expanded.prog, scratch_args(t)), "t = {}", t);
    }
}

#[test]
fn test_pipeline_reports_variant_scratch_memory() {
    init_logging();
    let mut names = NameSource::new();
    let prog = scratch_prog(&mut names, true);
    let expanded = compile(prog.clone(), names);
    assert!(expanded.has_diagnostics());
    assert_eq!(expanded.diagnostics.len(), 1);
    for t in [0, 1, 4] {
        assert_eq!(run(&prog, scratch_args(t)), run(&expanded.prog, scratch_args(t)), "t = {}", t);
    }
}

#[test]
fn test_pipeline_is_idempotent_on_its_output() {
    init_logging();
    let mut names = NameSource::new();
    let prog = scratch_prog(&mut names, false);
    let expanded = compile(prog, names);
    let again = Pipeline::new(expanded.prog.clone(), expanded.names)
        .simplify(&SimplifyConfig::default())
        .expect("simplification failed");
    assert_eq!(
        run(&again.prog, scratch_args(4)),
        run(&expanded.prog, scratch_args(4))
    );
    assert!(kernels(main_body(&again.prog))
        .iter()
        .all(|op| !matches!(op, KernelOp::MapKernel(k) if has_alloc(&k.body))));
}

// =============================================================================
// Chunked kernels
// =============================================================================

/// `main(n, t, chunk)`: a chunked map over `iota(n, 0, 1)` that returns its
/// chunks unchanged.
fn chunked_iota_prog(names: &mut NameSource, ordering: StreamOrd) -> Prog {
    let n = names.fresh("n");
    let t = names.fresh("t");
    let chunk = names.fresh("chunk");
    let is = names.fresh("is");
    let tid = names.fresh("tid");
    let cs = names.fresh("cs");
    let part = names.fresh("part");
    let out = names.fresh("out");

    let part_t = i64_array(var(&cs));
    let kernel = Exp::Op(KernelOp::ChunkedMapKernel(ChunkedMapKernel {
        certs: Certs::none(),
        width: var(&n),
        size: kernel_size(var(&t), var(&chunk)),
        ordering,
        lambda: lambda(
            vec![param(&tid, i64_t()), param(&cs, i64_t()), param(&part, part_t.clone())],
            Body::just(vec![var(&part)]),
            vec![part_t],
        ),
        arrays: vec![is.clone()],
    }));
    let body = Body::new(
        vec![
            Stm::single(
                is,
                i64_array(var(&n)),
                Exp::Iota {
                    n: var(&n),
                    start: c(0),
                    stride: c(1),
                },
            ),
            Stm::single(out.clone(), i64_array(var(&n)), kernel),
        ],
        vec![var(&out)],
    );
    main_prog(
        vec![param(&n, i64_t()), param(&t, i64_t()), param(&chunk, i64_t())],
        vec![i64_array(var(&n))],
        body,
    )
}

#[test]
fn test_pipeline_fuses_chunked_iota() {
    init_logging();
    for ordering in [StreamOrd::InOrder, StreamOrd::Disorder] {
        let mut names = NameSource::new();
        let prog = chunked_iota_prog(&mut names, ordering);
        let expanded = compile(prog.clone(), names);
        match kernels(main_body(&expanded.prog)).as_slice() {
            [KernelOp::ChunkedMapKernel(k)] => assert!(k.arrays.is_empty(), "{:?}", ordering),
            other => panic!("expected one chunked map kernel, got {:?}", other),
        }
        // (n, threads, per-thread chunk) with threads * chunk >= n.
        for (n, t, chunk) in [(7, 3, 3), (6, 2, 3), (4, 1, 4), (0, 1, 0), (5, 8, 1)] {
            let args = || vec![Value::i64(n), Value::i64(t), Value::i64(chunk)];
            let expected: Vec<i64> = (0..n).collect();
            assert_eq!(run(&expanded.prog, args()), vec![Value::i64_array(&expected)]);
            assert_eq!(run(&prog, args()), run(&expanded.prog, args()));
        }
    }
}

//! Tests for allocation expansion.

use std::collections::{HashMap, HashSet};

use crate::error::CompilerError;
use crate::eval::Value;
use crate::expand_allocations::{expand_prog, ExpandConfig, Expansion, Rebase};
use crate::ir::{
    BinOp, Body, Certs, ChunkedMapKernel, Exp, IxFun, Kernel, KernelBody, KernelOp, KernelResult, KernelSpace,
    KernelStm, NameSource, PatElem, Pattern, PrimExp, PrimValue, Prog, ScanKernel, Space, Stm, StreamOrd, SubExp, Type,
    VName, WhichThreads, WriteKernel,
};
use crate::test_support::*;

/// Names of the map-kernel test program.
struct AllocProgram {
    prog: Prog,
    n: VName,
    t: VName,
    bytes: VName,
    tid: VName,
    mem: VName,
    size: VName,
}

/// `main(n, t, bytes, xs: [t]i64)`: every thread allocates a block, fills
/// `n` elements of it with `iota(n, x, 1)` and returns the last one. With
/// `variant`, the block size is computed from the thread's input.
fn alloc_kernel(names: &mut NameSource, variant: bool) -> AllocProgram {
    let n = names.fresh("n");
    let t = names.fresh("t");
    let bytes = names.fresh("bytes");
    let xs = names.fresh("xs");
    let tid = names.fresh("tid");
    let i = names.fresh("i");
    let x = names.fresh("x");
    let size = names.fresh("size");
    let mem = names.fresh("mem");
    let buf = names.fresh("buf");
    let last = names.fresh("last");
    let r = names.fresh("r");
    let ys = names.fresh("ys");

    let mut stms = Vec::new();
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
    let buf_pe = PatElem::new(buf.clone(), i64_array(var(&n))).in_mem(mem.clone(), IxFun::iota(vec![PrimExp::var(&n)]));
    stms.push(Stm::new(
        Pattern::new(vec![buf_pe]),
        Exp::Iota {
            n: var(&n),
            start: var(&x),
            stride: c(1),
        },
    ));
    stms.push(let_i64(&last, binop(BinOp::Sub, var(&n), c(1))));
    stms.push(let_i64(
        &r,
        Exp::Index {
            arr: buf,
            indices: vec![var(&last)],
        },
    ));

    let kernel = map_1d(
        var(&t),
        &tid,
        &i,
        vec![input(&x, i64_t(), &xs, vec![var(&i)])],
        vec![i64_t()],
        Body::new(stms, vec![var(&r)]),
    );
    let body = Body::new(vec![Stm::single(ys.clone(), i64_array(var(&t)), kernel)], vec![var(&ys)]);
    let prog = main_prog(
        vec![
            param(&n, i64_t()),
            param(&t, i64_t()),
            param(&bytes, i64_t()),
            param(&xs, i64_array(var(&t))),
        ],
        vec![i64_array(var(&t))],
        body,
    );
    AllocProgram {
        prog,
        n,
        t,
        bytes,
        tid,
        mem,
        size,
    }
}

fn expand(prog: Prog, names: &mut NameSource) -> Expansion {
    expand_prog(prog, &ExpandConfig::default(), names).expect("expansion failed")
}

fn map_kernel_body(prog: &Prog) -> &Body {
    for stm in &main_body(prog).stms {
        if let Exp::Op(KernelOp::MapKernel(k)) = &stm.exp {
            return &k.body;
        }
    }
    panic!("no map kernel in {:?}", main_body(prog))
}

fn has_alloc(body: &Body) -> bool {
    body.stms.iter().any(|s| matches!(s.exp, Exp::Alloc { .. }))
}

fn alloc_args() -> Vec<Value> {
    vec![Value::i64(2), Value::i64(3), Value::i64(16), Value::i64_array(&[1, 2, 3])]
}

// =============================================================================
// Expansion
// =============================================================================

#[test]
fn test_invariant_allocation_is_expanded() {
    init_logging();
    let mut names = NameSource::new();
    let p = alloc_kernel(&mut names, false);
    let expansion = expand(p.prog.clone(), &mut names);
    assert!(expansion.diagnostics.is_empty());

    let top = &main_body(&expansion.prog).stms;
    assert_eq!(top.len(), 3);
    let total = top[0].pat.single_name().expect("total size binding").clone();
    assert_eq!(
        top[0].exp,
        Exp::BinOp {
            op: BinOp::Mul,
            x: var(&p.t),
            y: var(&p.bytes),
        }
    );
    let mem_pe = &top[1].pat.values[0];
    assert_eq!(mem_pe.name, p.mem);
    assert_eq!(mem_pe.ty, Type::mem(var(&total), Space::Default));
    assert_eq!(
        top[1].exp,
        Exp::Alloc {
            size: var(&total),
            space: Space::Default,
        }
    );

    let body = map_kernel_body(&expansion.prog);
    assert!(!has_alloc(body));
    let placed = body
        .stms
        .iter()
        .find_map(|s| s.pat.values.first().and_then(|pe| pe.mem.clone()))
        .expect("array placed in memory");
    assert_eq!(placed.mem, p.mem);
    let rebase = Rebase {
        thread: PrimExp::var(&p.tid),
        num_threads: PrimExp::var(&p.t),
    };
    assert_eq!(placed.ixfun, rebase.new_base(&[PrimExp::var(&p.n)]));

    assert_eq!(run(&expansion.prog, alloc_args()), vec![Value::i64_array(&[2, 3, 4])]);
    assert_eq!(run(&p.prog, alloc_args()), run(&expansion.prog, alloc_args()));
}

#[test]
fn test_expanded_layout_is_disjoint() {
    init_logging();
    let mut names = NameSource::new();
    let p = alloc_kernel(&mut names, false);
    let expansion = expand(p.prog, &mut names);
    let placed = map_kernel_body(&expansion.prog)
        .stms
        .iter()
        .find_map(|s| s.pat.values.first().and_then(|pe| pe.mem.clone()))
        .expect("array placed in memory");

    let (threads, elems) = (4, 3);
    let mut seen = HashSet::new();
    for t in 0..threads {
        let env: HashMap<VName, i64> = [(p.tid.clone(), t), (p.t.clone(), threads), (p.n.clone(), elems)]
            .into_iter()
            .collect();
        for i in 0..elems {
            let offset = placed.ixfun.offset(&[i], &env).expect("offset evaluates");
            assert_eq!(offset, i * threads + t);
            assert!(seen.insert(offset), "offset {} used twice", offset);
        }
    }
    assert_eq!(seen.len(), (threads * elems) as usize);
}

#[test]
fn test_variant_allocation_is_reported() {
    init_logging();
    let mut names = NameSource::new();
    let p = alloc_kernel(&mut names, true);
    let expansion = expand(p.prog.clone(), &mut names);

    assert_eq!(expansion.diagnostics.len(), 1);
    let diag = &expansion.diagnostics[0];
    assert_eq!(diag.size, p.size);
    assert_eq!(diag.mem.name, p.mem);
    assert!(diag.to_string().contains("not invariant"));

    assert_eq!(main_body(&expansion.prog).stms.len(), 1);
    assert!(has_alloc(map_kernel_body(&expansion.prog)));
    assert_eq!(run(&p.prog, alloc_args()), run(&expansion.prog, alloc_args()));
}

#[test]
fn test_strict_mode_rejects_variant_allocation() {
    init_logging();
    let mut names = NameSource::new();
    let p = alloc_kernel(&mut names, true);
    let config = ExpandConfig {
        strict_invariance: true,
    };
    match expand_prog(p.prog, &config, &mut names) {
        Err(CompilerError::ExpandError(msg)) => {
            assert!(msg.contains("in function main"), "{}", msg);
            assert!(msg.contains("not invariant"), "{}", msg);
        }
        other => panic!("expected an expansion error, got {:?}", other),
    }
}

#[test]
fn test_strict_mode_accepts_invariant_allocation() {
    init_logging();
    let mut names = NameSource::new();
    let p = alloc_kernel(&mut names, false);
    let config = ExpandConfig {
        strict_invariance: true,
    };
    let expansion = expand_prog(p.prog, &config, &mut names).unwrap();
    assert!(expansion.diagnostics.is_empty());
}

#[test]
fn test_existential_memory_is_rejected() {
    init_logging();
    let mut names = NameSource::new();
    let mut p = alloc_kernel(&mut names, false);
    let m2 = names.fresh("m2");
    let moved = names.fresh("moved");
    let buf = map_kernel_body(&p.prog).stms[1].pat.values[0].name.clone();

    let branch_body = || Body::just(vec![var(&p.mem), var(&buf)]);
    let existential = Stm::new(
        Pattern {
            context: vec![PatElem::new(m2.clone(), Type::mem(var(&p.bytes), Space::Default))],
            values: vec![PatElem::new(moved, i64_array(var(&p.n))).in_mem(m2, IxFun::iota(vec![PrimExp::var(&p.n)]))],
        },
        Exp::If {
            cond: SubExp::Const(PrimValue::Bool(true)),
            then_body: branch_body(),
            else_body: branch_body(),
            ret: vec![Type::mem(var(&p.bytes), Space::Default), i64_array(var(&p.n))],
        },
    );
    if let Exp::Op(KernelOp::MapKernel(k)) = &mut p.prog.funs[0].body.stms[0].exp {
        k.body.stms.insert(2, existential);
    }

    match expand_prog(p.prog, &ExpandConfig::default(), &mut names) {
        Err(CompilerError::ExpandError(msg)) => assert!(msg.contains("existential"), "{}", msg),
        other => panic!("expected an expansion error, got {:?}", other),
    }
}

// =============================================================================
// Other kernels
// =============================================================================

#[test]
fn test_write_kernel_is_untouched() {
    init_logging();
    let mut names = NameSource::new();
    let n = names.fresh("n");
    let bytes = names.fresh("bytes");
    let dest = names.fresh("dest");
    let tid = names.fresh("tid");
    let mem = names.fresh("mem");
    let v = names.fresh("v");
    let out = names.fresh("out");

    let lambda_body = Body::new(
        vec![
            Stm::single(
                mem.clone(),
                Type::mem(var(&bytes), Space::Default),
                Exp::Alloc {
                    size: var(&bytes),
                    space: Space::Default,
                },
            ),
            let_i64(&v, binop(BinOp::Add, var(&tid), c(1))),
        ],
        vec![var(&tid), var(&v)],
    );
    let kernel = Exp::Op(KernelOp::WriteKernel(WriteKernel {
        certs: Certs::none(),
        width: var(&n),
        lambda: lambda(vec![param(&tid, i64_t())], lambda_body, vec![i64_t(), i64_t()]),
        arrays: Vec::new(),
        dests: vec![(var(&n), dest.clone())],
    }));
    let body = Body::new(vec![Stm::single(out.clone(), i64_array(var(&n)), kernel)], vec![var(&out)]);
    let prog = main_prog(
        vec![param(&n, i64_t()), param(&bytes, i64_t()), param(&dest, i64_array(var(&n)))],
        vec![i64_array(var(&n))],
        body,
    );
    let expansion = expand(prog.clone(), &mut names);
    assert_eq!(expansion.prog, prog);
    assert!(expansion.diagnostics.is_empty());
}

#[test]
fn test_chunked_map_allocation_uses_thread_count() {
    init_logging();
    let mut names = NameSource::new();
    let n = names.fresh("n");
    let t = names.fresh("t");
    let chunk = names.fresh("chunk");
    let bytes = names.fresh("bytes");
    let xs = names.fresh("xs");
    let tid = names.fresh("tid");
    let cs = names.fresh("cs");
    let chunk_param = names.fresh("chunk");
    let mem = names.fresh("mem");
    let ys = names.fresh("ys");

    let chunk_t = i64_array(var(&cs));
    let lambda_body = Body::new(
        vec![Stm::single(
            mem.clone(),
            Type::mem(var(&bytes), Space::Local),
            Exp::Alloc {
                size: var(&bytes),
                space: Space::Local,
            },
        )],
        vec![var(&chunk_param)],
    );
    let kernel = Exp::Op(KernelOp::ChunkedMapKernel(ChunkedMapKernel {
        certs: Certs::none(),
        width: var(&n),
        size: kernel_size(var(&t), var(&chunk)),
        ordering: StreamOrd::Disorder,
        lambda: lambda(
            vec![param(&tid, i64_t()), param(&cs, i64_t()), param(&chunk_param, chunk_t.clone())],
            lambda_body,
            vec![chunk_t],
        ),
        arrays: vec![xs.clone()],
    }));
    let body = Body::new(vec![Stm::single(ys.clone(), i64_array(var(&n)), kernel)], vec![var(&ys)]);
    let prog = main_prog(
        vec![
            param(&n, i64_t()),
            param(&t, i64_t()),
            param(&chunk, i64_t()),
            param(&bytes, i64_t()),
            param(&xs, i64_array(var(&n))),
        ],
        vec![i64_array(var(&n))],
        body,
    );
    let expansion = expand(prog.clone(), &mut names);

    let top = &main_body(&expansion.prog).stms;
    assert_eq!(top.len(), 3);
    assert_eq!(
        top[0].exp,
        Exp::BinOp {
            op: BinOp::Mul,
            x: var(&t),
            y: var(&bytes),
        }
    );
    assert!(matches!(
        top[1].exp,
        Exp::Alloc {
            space: Space::Local,
            ..
        }
    ));
    let args = vec![
        Value::i64(5),
        Value::i64(2),
        Value::i64(3),
        Value::i64(8),
        Value::i64_array(&[1, 2, 3, 4, 5]),
    ];
    assert_eq!(run(&prog, args.clone()), run(&expansion.prog, args));
}

#[test]
fn test_explicit_kernel_allocations_are_expanded() {
    init_logging();
    let mut names = NameSource::new();
    let t = names.fresh("t");
    let bytes = names.fresh("bytes");
    let space = KernelSpace {
        global_tid: names.fresh("gtid"),
        local_tid: names.fresh("ltid"),
        group_id: names.fresh("gid"),
    };
    let mem = names.fresh("mem");
    let flag = names.fresh("flag");
    let v = names.fresh("v");
    let v0 = names.fresh("v");
    let out = names.fresh("out");

    // The allocation sits in a branch of the thread body.
    let alloc_branch = Exp::If {
        cond: var(&flag),
        then_body: Body::new(
            vec![Stm::single(
                mem.clone(),
                Type::mem(var(&bytes), Space::Default),
                Exp::Alloc {
                    size: var(&bytes),
                    space: Space::Default,
                },
            )],
            vec![c(1)],
        ),
        else_body: Body::just(vec![c(0)]),
        ret: vec![i64_t()],
    };
    let kbody = KernelBody {
        stms: vec![KernelStm::Thread {
            pat: Pattern::single(v.clone(), i64_t()),
            threads: WhichThreads::AllThreads,
            body: Body::new(vec![let_i64(&v0, alloc_branch)], vec![var(&v0)]),
        }],
        result: vec![KernelResult::AllThreadsReturn(var(&v))],
    };
    let kernel = Exp::Op(KernelOp::Kernel(Kernel {
        certs: Certs::none(),
        size: kernel_size(var(&t), c(1)),
        space,
        returns: vec![i64_array(var(&t))],
        body: kbody,
    }));
    let body = Body::new(vec![Stm::single(out.clone(), i64_array(var(&t)), kernel)], vec![var(&out)]);
    let prog = main_prog(
        vec![
            param(&t, i64_t()),
            param(&bytes, i64_t()),
            param(&flag, Type::Prim(crate::ir::PrimType::Bool)),
        ],
        vec![i64_array(var(&t))],
        body,
    );
    let expansion = expand(prog.clone(), &mut names);

    let top = &main_body(&expansion.prog).stms;
    assert_eq!(top.len(), 3);
    assert_eq!(top[1].pat.values[0].name, mem);
    match kernels(main_body(&expansion.prog)).as_slice() {
        [KernelOp::Kernel(k)] => match &k.body.stms[0] {
            KernelStm::Thread { body, .. } => match &body.stms[0].exp {
                Exp::If { then_body, .. } => assert!(!has_alloc(then_body)),
                other => panic!("expected a branch, got {:?}", other),
            },
            other => panic!("expected a thread statement, got {:?}", other),
        },
        other => panic!("expected one kernel, got {:?}", other),
    }

    let args = vec![Value::i64(3), Value::i64(8), Value::bool(true)];
    assert_eq!(run(&expansion.prog, args.clone()), vec![Value::i64_array(&[1, 1, 1])]);
    assert_eq!(run(&prog, args.clone()), run(&expansion.prog, args));
}

#[test]
fn test_loop_carried_memory_is_rebased() {
    init_logging();
    let mut names = NameSource::new();
    let n = names.fresh("n");
    let t = names.fresh("t");
    let bytes = names.fresh("bytes");
    let xs = names.fresh("xs");
    let tid = names.fresh("tid");
    let i = names.fresh("i");
    let x = names.fresh("x");
    let mem = names.fresh("mem");
    let buf = names.fresh("buf");
    let acc = names.fresh("acc");
    let j = names.fresh("j");
    let v = names.fresh("v");
    let acc2 = names.fresh("acc");
    let res = names.fresh("res");
    let last = names.fresh("last");
    let r = names.fresh("r");
    let ys = names.fresh("ys");

    let row_t = i64_array(var(&n));
    let layout = || IxFun::iota(vec![PrimExp::var(&n)]);
    // acc[j] = x + j for every j < n, in place in the thread's block.
    let loop_body = Body::new(
        vec![
            let_i64(&v, binop(BinOp::Add, var(&x), var(&j))),
            Stm::new(
                Pattern::new(vec![PatElem::new(acc2.clone(), row_t.clone()).in_mem(mem.clone(), layout())]),
                Exp::Update {
                    arr: acc.clone(),
                    indices: vec![var(&j)],
                    value: var(&v),
                },
            ),
        ],
        vec![var(&acc2)],
    );
    let kbody = Body::new(
        vec![
            Stm::single(
                mem.clone(),
                Type::mem(var(&bytes), Space::Default),
                Exp::Alloc {
                    size: var(&bytes),
                    space: Space::Default,
                },
            ),
            Stm::new(
                Pattern::new(vec![PatElem::new(buf.clone(), row_t.clone()).in_mem(mem.clone(), layout())]),
                Exp::Replicate {
                    shape: vec![var(&n)],
                    value: c(0),
                },
            ),
            Stm::new(
                Pattern::new(vec![PatElem::new(res.clone(), row_t.clone()).in_mem(mem.clone(), layout())]),
                Exp::DoLoop {
                    ctx_merge: Vec::new(),
                    val_merge: vec![(param(&acc, row_t.clone()).in_mem(mem.clone(), layout()), var(&buf))],
                    index: j,
                    bound: var(&n),
                    body: loop_body,
                },
            ),
            let_i64(&last, binop(BinOp::Sub, var(&n), c(1))),
            let_i64(
                &r,
                Exp::Index {
                    arr: res.clone(),
                    indices: vec![var(&last)],
                },
            ),
        ],
        vec![var(&r)],
    );
    let kernel = map_1d(
        var(&t),
        &tid,
        &i,
        vec![input(&x, i64_t(), &xs, vec![var(&i)])],
        vec![i64_t()],
        kbody,
    );
    let prog = main_prog(
        vec![
            param(&n, i64_t()),
            param(&t, i64_t()),
            param(&bytes, i64_t()),
            param(&xs, i64_array(var(&t))),
        ],
        vec![i64_array(var(&t))],
        Body::new(vec![Stm::single(ys.clone(), i64_array(var(&t)), kernel)], vec![var(&ys)]),
    );
    let expansion = expand(prog.clone(), &mut names);
    assert!(expansion.diagnostics.is_empty());

    let expected = Rebase {
        thread: PrimExp::var(&tid),
        num_threads: PrimExp::var(&t),
    }
    .new_base(&[PrimExp::var(&n)]);
    let body = map_kernel_body(&expansion.prog);
    assert!(!has_alloc(body));
    let loop_stm = body
        .stms
        .iter()
        .find(|s| matches!(s.exp, Exp::DoLoop { .. }))
        .expect("loop kept in the kernel");
    assert_eq!(loop_stm.pat.values[0].mem.as_ref().map(|mb| &mb.ixfun), Some(&expected));
    match &loop_stm.exp {
        Exp::DoLoop { val_merge, body, .. } => {
            let merge = val_merge[0].0.mem.as_ref().expect("merge parameter placed in memory");
            assert_eq!(merge.mem, mem);
            assert_eq!(merge.ixfun, expected);
            let updated = body.stms[1].pat.values[0].mem.as_ref().expect("update placed in memory");
            assert_eq!(updated.ixfun, expected);
        }
        other => panic!("expected a loop, got {:?}", other),
    }

    let args = vec![Value::i64(3), Value::i64(2), Value::i64(24), Value::i64_array(&[10, 20])];
    assert_eq!(run(&expansion.prog, args.clone()), vec![Value::i64_array(&[12, 22])]);
    assert_eq!(run(&prog, args.clone()), run(&expansion.prog, args));
}

#[test]
fn test_scan_lambdas_are_expanded_independently() {
    init_logging();
    let mut names = NameSource::new();
    let n = names.fresh("n");
    let t = names.fresh("t");
    let bytes = names.fresh("bytes");
    let xs = names.fresh("xs");
    let out = names.fresh("out");

    // `\i acc x -> acc + replicate(2, x)[k]` with its own scratch block.
    let scratch_op = |names: &mut NameSource, k: i64| {
        let i = names.fresh("i");
        let acc = names.fresh("acc");
        let x = names.fresh("x");
        let mem = names.fresh("mem");
        let tmp = names.fresh("tmp");
        let e = names.fresh("e");
        let s = names.fresh("s");
        let body = Body::new(
            vec![
                Stm::single(
                    mem.clone(),
                    Type::mem(var(&bytes), Space::Default),
                    Exp::Alloc {
                        size: var(&bytes),
                        space: Space::Default,
                    },
                ),
                Stm::new(
                    Pattern::new(vec![PatElem::new(tmp.clone(), i64_array(c(2)))
                        .in_mem(mem.clone(), IxFun::iota(vec![PrimExp::constant(2)]))]),
                    Exp::Replicate {
                        shape: vec![c(2)],
                        value: var(&x),
                    },
                ),
                let_i64(
                    &e,
                    Exp::Index {
                        arr: tmp,
                        indices: vec![c(k)],
                    },
                ),
                let_i64(&s, binop(BinOp::Add, var(&acc), var(&e))),
            ],
            vec![var(&s)],
        );
        let op = lambda(
            vec![param(&i, i64_t()), param(&acc, i64_t()), param(&x, i64_t())],
            body,
            vec![i64_t()],
        );
        (op, i, mem)
    };
    let (combine, combine_thread, combine_mem) = scratch_op(&mut names, 1);
    let (fold, fold_thread, fold_mem) = scratch_op(&mut names, 0);

    let kernel = Exp::Op(KernelOp::ScanKernel(ScanKernel {
        certs: Certs::none(),
        width: var(&n),
        size: kernel_size(var(&t), c(1)),
        lambda: combine,
        fold_lambda: fold,
        nes: vec![c(0)],
        arrays: vec![xs.clone()],
    }));
    let prog = main_prog(
        vec![
            param(&n, i64_t()),
            param(&t, i64_t()),
            param(&bytes, i64_t()),
            param(&xs, i64_array(var(&n))),
        ],
        vec![i64_array(var(&n))],
        Body::new(vec![Stm::single(out.clone(), i64_array(var(&n)), kernel)], vec![var(&out)]),
    );
    let expansion = expand(prog.clone(), &mut names);
    assert!(expansion.diagnostics.is_empty());

    let top = &main_body(&expansion.prog).stms;
    assert_eq!(top.len(), 5);
    assert_eq!(top[1].pat.values[0].name, combine_mem);
    assert_eq!(top[3].pat.values[0].name, fold_mem);
    for total in [&top[0], &top[2]] {
        assert_eq!(
            total.exp,
            Exp::BinOp {
                op: BinOp::Mul,
                x: var(&t),
                y: var(&bytes),
            }
        );
    }

    let placed = |lambda: &crate::ir::Lambda| {
        assert!(!has_alloc(&lambda.body));
        lambda.body.stms[0].pat.values[0]
            .mem
            .as_ref()
            .expect("scratch array placed in memory")
            .ixfun
            .clone()
    };
    let rebased_for = |thread: &VName| {
        Rebase {
            thread: PrimExp::var(thread),
            num_threads: PrimExp::var(&t),
        }
        .new_base(&[PrimExp::constant(2)])
    };
    match kernels(main_body(&expansion.prog)).as_slice() {
        [KernelOp::ScanKernel(k)] => {
            assert_eq!(placed(&k.lambda), rebased_for(&combine_thread));
            assert_eq!(placed(&k.fold_lambda), rebased_for(&fold_thread));
        }
        other => panic!("expected one scan kernel, got {:?}", other),
    }

    let args = vec![Value::i64(4), Value::i64(2), Value::i64(16), Value::i64_array(&[1, 2, 3, 4])];
    assert_eq!(run(&expansion.prog, args.clone()), vec![Value::i64_array(&[1, 3, 6, 10])]);
    assert_eq!(run(&prog, args.clone()), run(&expansion.prog, args));
}

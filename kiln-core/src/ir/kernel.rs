//! Kernel operations.
//!
//! These are the operations produced by kernel extraction. Every variant
//! describes work executed once per logical thread; the per-thread code is
//! either a body with explicitly bound thread/space names or a lambda whose
//! first parameter is the thread (or element) index.

use super::{Body, Certs, Lambda, Param, PatElem, Pattern, SubExp, Type, VName};

#[derive(Debug, Clone, PartialEq)]
pub enum KernelOp {
    MapKernel(MapKernel),
    ScanKernel(ScanKernel),
    ChunkedMapKernel(ChunkedMapKernel),
    WriteKernel(WriteKernel),
    Kernel(Kernel),
    /// Number of workgroups chosen by the runtime.
    NumGroups,
    /// Workgroup size chosen by the runtime.
    GroupSize,
}

impl KernelOp {
    pub fn name(&self) -> &'static str {
        match self {
            KernelOp::MapKernel(_) => "map_kernel",
            KernelOp::ScanKernel(_) => "scan_kernel",
            KernelOp::ChunkedMapKernel(_) => "chunked_map_kernel",
            KernelOp::WriteKernel(_) => "write_kernel",
            KernelOp::Kernel(_) => "kernel",
            KernelOp::NumGroups => "num_groups",
            KernelOp::GroupSize => "group_size",
        }
    }
}

/// Launch geometry of a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSize {
    pub num_groups: SubExp,
    pub group_size: SubExp,
    /// Elements per thread in the in-order (chunked) layout.
    pub thread_chunk: SubExp,
    pub num_elements: SubExp,
    pub offset_multiple: SubExp,
    /// Total number of logical threads.
    pub num_threads: SubExp,
}

impl KernelSize {
    pub fn subexps(&self) -> [&SubExp; 6] {
        [
            &self.num_groups,
            &self.group_size,
            &self.thread_chunk,
            &self.num_elements,
            &self.offset_multiple,
            &self.num_threads,
        ]
    }
}

/// How a flat index space is divided between threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamOrd {
    /// Thread `t` gets the contiguous range starting at `t * thread_chunk`.
    InOrder,
    /// Thread `t` gets elements `t, t + num_threads, t + 2 * num_threads, ...`.
    Disorder,
}

/// Binds a per-thread parameter to `array[indices]`.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelInput {
    pub param: Param,
    pub array: VName,
    pub indices: Vec<SubExp>,
}

/// One thread per point of the index space `ispace`.
#[derive(Debug, Clone, PartialEq)]
pub struct MapKernel {
    pub certs: Certs,
    /// Total number of threads; the product of the `ispace` dimensions.
    pub width: SubExp,
    /// Flat thread index.
    pub thread_index: VName,
    pub ispace: Vec<(VName, SubExp)>,
    pub inputs: Vec<KernelInput>,
    /// Per-thread return type and the permutation applied to the
    /// assembled output.
    pub returns: Vec<(Type, Vec<usize>)>,
    pub body: Body,
}

impl MapKernel {
    pub fn space_shape(&self) -> Vec<SubExp> {
        self.ispace.iter().map(|(_, d)| d.clone()).collect()
    }

    /// Names bound for the duration of one thread's body.
    pub fn bound_names(&self) -> Vec<VName> {
        let mut names = vec![self.thread_index.clone()];
        names.extend(self.ispace.iter().map(|(v, _)| v.clone()));
        names.extend(self.inputs.iter().map(|inp| inp.param.name.clone()));
        names
    }
}

/// Inclusive scan. `fold_lambda` takes `[index, accs..., elems...]` and is
/// applied sequentially by each thread; `lambda` takes `[index, xs..., ys...]`
/// and combines partial results across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanKernel {
    pub certs: Certs,
    pub width: SubExp,
    pub size: KernelSize,
    pub lambda: Lambda,
    pub fold_lambda: Lambda,
    pub nes: Vec<SubExp>,
    pub arrays: Vec<VName>,
}

/// Each thread processes one chunk of the input. The lambda takes
/// `[thread_index, chunk_size, chunks...]` and returns one chunk per output.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkedMapKernel {
    pub certs: Certs,
    pub width: SubExp,
    pub size: KernelSize,
    pub ordering: StreamOrd,
    pub lambda: Lambda,
    pub arrays: Vec<VName>,
}

/// Scatter. The lambda takes `[thread_index, elems...]` and returns one index
/// per destination followed by one value per destination. Consumes the
/// destination arrays.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteKernel {
    pub certs: Certs,
    pub width: SubExp,
    pub lambda: Lambda,
    pub arrays: Vec<VName>,
    pub dests: Vec<(SubExp, VName)>,
}

/// Thread identity names of an explicit kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpace {
    pub global_tid: VName,
    pub local_tid: VName,
    pub group_id: VName,
}

impl KernelSpace {
    pub fn names(&self) -> [&VName; 3] {
        [&self.global_tid, &self.local_tid, &self.group_id]
    }
}

/// A kernel with explicit group/thread structure.
#[derive(Debug, Clone, PartialEq)]
pub struct Kernel {
    pub certs: Certs,
    pub size: KernelSize,
    pub space: KernelSpace,
    pub returns: Vec<Type>,
    pub body: KernelBody,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelBody {
    pub stms: Vec<KernelStm>,
    pub result: Vec<KernelResult>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhichThreads {
    AllThreads,
    /// Only the thread with this local id executes; the others see blank
    /// values.
    OneThreadPerGroup(SubExp),
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelStm {
    /// Split `arrays` (of outer size `width`) into one chunk per thread.
    SplitArray {
        size: PatElem,
        chunks: Vec<PatElem>,
        ordering: StreamOrd,
        width: SubExp,
        elems_per_thread: SubExp,
        arrays: Vec<VName>,
    },
    Thread {
        pat: Pattern,
        threads: WhichThreads,
        body: Body,
    },
    /// Reduce per-thread values across the first `width` threads of a group.
    /// Each input pairs a neutral element with a per-thread scalar; the
    /// operator takes `[index, accs..., elems...]` like a scan operator.
    GroupReduce {
        pat: Pattern,
        width: SubExp,
        lambda: Lambda,
        input: Vec<(SubExp, VName)>,
    },
}

impl KernelStm {
    /// Names bound by this statement.
    pub fn bound_names(&self) -> Vec<VName> {
        match self {
            KernelStm::SplitArray { size, chunks, .. } => std::iter::once(&size.name)
                .chain(chunks.iter().map(|pe| &pe.name))
                .cloned()
                .collect(),
            KernelStm::Thread { pat, .. } | KernelStm::GroupReduce { pat, .. } => pat.names().cloned().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KernelResult {
    /// Element `global_tid` of the output is this thread's value.
    AllThreadsReturn(SubExp),
    /// The thread writes its value at an index of its choosing.
    ThisThreadReturns { index: SubExp, value: SubExp },
    /// Per-thread chunks laid out according to `ordering`.
    ConcatReturns {
        ordering: StreamOrd,
        width: SubExp,
        per_thread_elems: SubExp,
        array: VName,
    },
}

use std::mem::MaybeUninit;

use pyo3::{ffi, prelude::*, types::PyDict};
use rquickjs::{
    Ctx,
    allocator::Allocator,
    qjs,
};

/// Bytes reserved in front of every block to remember its requested size.
/// Sixteen keeps the returned pointer aligned like the underlying `malloc`.
const HEADER: usize = 16;

/// Routes engine allocations through CPython's raw allocator so memory
/// accounting in the host (`tracemalloc` and friends) sees script memory too.
///
/// The raw domain is used because the engine allocates while the GIL is
/// released.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HostAllocator;

impl HostAllocator {
    unsafe fn finish(base: *mut u8, size: usize) -> *mut u8 {
        if base.is_null() {
            return std::ptr::null_mut();
        }
        // SAFETY: `base` points to at least `HEADER` writable bytes.
        unsafe {
            base.cast::<usize>().write(size);
            base.add(HEADER)
        }
    }

    unsafe fn base(ptr: *mut u8) -> *mut u8 {
        // SAFETY: `ptr` was returned by `finish`, `HEADER` bytes into its block.
        unsafe { ptr.sub(HEADER) }
    }
}

// SAFETY: every block handed out is `HEADER` bytes into a `PyMem_Raw*` block
// whose header records the requested size.
unsafe impl Allocator for HostAllocator {
    fn alloc(&mut self, size: usize) -> *mut u8 {
        let Some(total) = size.checked_add(HEADER) else {
            return std::ptr::null_mut();
        };
        // SAFETY: the raw domain is thread-safe and needs no GIL.
        unsafe { Self::finish(ffi::PyMem_RawMalloc(total).cast(), size) }
    }

    fn calloc(&mut self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count
            .checked_mul(size)
            .and_then(|bytes| bytes.checked_add(HEADER))
        else {
            return std::ptr::null_mut();
        };
        // SAFETY: the raw domain is thread-safe and needs no GIL.
        unsafe { Self::finish(ffi::PyMem_RawCalloc(1, total).cast(), total - HEADER) }
    }

    unsafe fn dealloc(&mut self, ptr: *mut u8) {
        if !ptr.is_null() {
            // SAFETY: `ptr` came from this allocator.
            unsafe { ffi::PyMem_RawFree(Self::base(ptr).cast()) };
        }
    }

    unsafe fn realloc(&mut self, ptr: *mut u8, new_size: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size);
        }
        if new_size == 0 {
            // SAFETY: forwarded from the caller.
            unsafe { self.dealloc(ptr) };
            return std::ptr::null_mut();
        }
        let Some(total) = new_size.checked_add(HEADER) else {
            return std::ptr::null_mut();
        };
        // SAFETY: `ptr` came from this allocator.
        unsafe {
            let base = ffi::PyMem_RawRealloc(Self::base(ptr).cast(), total);
            Self::finish(base.cast(), new_size)
        }
    }

    unsafe fn usable_size(ptr: *mut u8) -> usize {
        if ptr.is_null() {
            return 0;
        }
        // SAFETY: the header written by `finish` is aligned for `usize`.
        unsafe { Self::base(ptr).cast::<usize>().read() }
    }
}

/// The `JSRuntime` behind `ctx`.
pub(crate) fn engine_runtime(ctx: &Ctx<'_>) -> *mut qjs::JSRuntime {
    // SAFETY: a live `Ctx` always wraps a valid context pointer.
    unsafe { qjs::JS_GetRuntime(ctx.as_raw().as_ptr()) }
}

macro_rules! memory_stats {
    ($($field:ident),* $(,)?) => {
        /// Point-in-time allocation statistics of one runtime.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct MemoryStats {
            $(pub $field: i64,)*
        }

        impl MemoryStats {
            pub const FIELDS: &'static [&'static str] = &[$(stringify!($field)),*];

            fn from_raw(usage: &qjs::JSMemoryUsage) -> Self {
                Self {
                    $($field: usage.$field,)*
                }
            }

            pub fn to_dict<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyDict>> {
                let dict = PyDict::new(py);
                $(dict.set_item(stringify!($field), self.$field)?;)*
                Ok(dict)
            }
        }
    };
}

memory_stats!(
    malloc_size,
    malloc_limit,
    memory_used_size,
    malloc_count,
    memory_used_count,
    atom_count,
    atom_size,
    str_count,
    str_size,
    obj_count,
    obj_size,
    prop_count,
    prop_size,
    shape_count,
    shape_size,
    js_func_count,
    js_func_size,
    js_func_code_size,
    js_func_pc2line_count,
    js_func_pc2line_size,
    c_func_count,
    array_count,
    fast_array_count,
    fast_array_elements,
    binary_object_count,
    binary_object_size,
);

impl MemoryStats {
    pub(crate) fn snapshot(ctx: &Ctx<'_>) -> Self {
        let rt = engine_runtime(ctx);
        let mut usage = MaybeUninit::<qjs::JSMemoryUsage>::zeroed();
        // SAFETY: the runtime is locked and `usage` is zeroed before the engine fills it.
        let stats = unsafe {
            qjs::JS_ComputeMemoryUsage(rt, usage.as_mut_ptr());
            Self::from_raw(usage.assume_init_ref())
        };
        tracing::trace!(
            memory_used_size = stats.memory_used_size,
            obj_count = stats.obj_count,
            "computed memory usage"
        );
        stats
    }
}

pub(crate) fn set_memory_limit(ctx: &Ctx<'_>, limit: usize) {
    let limit = qjs::size_t::try_from(limit).unwrap_or(qjs::size_t::MAX);
    // SAFETY: the runtime behind `ctx` is locked by the caller.
    unsafe { qjs::JS_SetMemoryLimit(engine_runtime(ctx), limit) };
}

pub(crate) fn set_max_stack_size(ctx: &Ctx<'_>, size: usize) {
    let size = qjs::size_t::try_from(size).unwrap_or(qjs::size_t::MAX);
    // SAFETY: the runtime behind `ctx` is locked by the caller.
    unsafe { qjs::JS_SetMaxStackSize(engine_runtime(ctx), size) };
}

pub(crate) fn run_gc(ctx: &Ctx<'_>) {
    // SAFETY: the runtime behind `ctx` is locked by the caller.
    unsafe { qjs::JS_RunGC(engine_runtime(ctx)) };
}

//! Raw storage for described struct instances.
//!
//! Generator instances and universe resource containers are allocated from
//! descriptor size/alignment and driven through the descriptor's lifecycle
//! functors rather than Rust constructors.

use crate::reflection::registry::{Lifecycle, StructType};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

pub struct RawInstance {
    data: NonNull<u8>,
    layout: Layout,
    lifecycle: Option<Arc<dyn Lifecycle>>,
}

// Owners coordinate access; the runtime never hands the same instance to two
// parties at once.
unsafe impl Send for RawInstance {}
unsafe impl Sync for RawInstance {}

impl RawInstance {
    /// Allocates zeroed storage for a described struct and runs its `init`
    /// functor when one is attached.
    pub fn for_struct(descriptor: &StructType) -> Self {
        let layout = Layout::from_size_align(
            (descriptor.size as usize).max(1),
            (descriptor.alignment as usize).max(1),
        )
        .expect("struct descriptor layout");

        let data = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(data).expect("instance allocation failed");

        if let Some(lifecycle) = &descriptor.lifecycle {
            lifecycle.init(data.as_ptr());
        }

        RawInstance {
            data,
            layout,
            lifecycle: descriptor.lifecycle.clone(),
        }
    }

    /// Moves a typed value into raw storage. The value's own drop is
    /// forgotten; teardown belongs to the optional lifecycle functor.
    pub fn from_value<T>(value: T, lifecycle: Option<Arc<dyn Lifecycle>>) -> Self {
        let layout = Layout::new::<T>();
        let layout = Layout::from_size_align(layout.size().max(1), layout.align()).unwrap();
        let data = unsafe { alloc_zeroed(layout) };
        let data = NonNull::new(data).expect("instance allocation failed");

        unsafe {
            (data.as_ptr() as *mut T).write(value);
        }

        RawInstance {
            data,
            layout,
            lifecycle,
        }
    }

    pub fn ptr(&self) -> *mut u8 {
        self.data.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), self.layout.size()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data.as_ptr(), self.layout.size()) }
    }
}

impl Drop for RawInstance {
    fn drop(&mut self) {
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.shutdown(self.data.as_ptr());
        }

        unsafe {
            dealloc(self.data.as_ptr(), self.layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interning::intern;
    use crate::reflection::registry::{Archetype, Field};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn for_struct_runs_lifecycle() {
        static INIT_CALLS: AtomicUsize = AtomicUsize::new(0);
        static SHUTDOWN_CALLS: AtomicUsize = AtomicUsize::new(0);

        struct Counting;

        impl Lifecycle for Counting {
            fn init(&self, instance: *mut u8) {
                INIT_CALLS.fetch_add(1, Ordering::SeqCst);
                unsafe { (instance as *mut u64).write(99) };
            }

            fn shutdown(&self, _instance: *mut u8) {
                SHUTDOWN_CALLS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let descriptor = StructType {
            name: intern("counted"),
            size: 8,
            alignment: 8,
            lifecycle: Some(Arc::new(Counting)),
            fields: vec![Field {
                name: intern("value"),
                offset: 0,
                size: 8,
                archetype: Archetype::UnsignedInt,
            }],
        };

        {
            let instance = RawInstance::for_struct(&descriptor);
            let value = unsafe { (instance.ptr() as *const u64).read() };
            assert_eq!(value, 99);
        }

        assert_eq!(INIT_CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(SHUTDOWN_CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn from_value_keeps_bytes() {
        let instance = RawInstance::from_value(0x1122_3344u32, None);
        let value = unsafe { (instance.ptr() as *const u32).read() };
        assert_eq!(value, 0x1122_3344);
    }
}

//! Type-erased growable array embedded into reflected instances.
//!
//! Item size and alignment are supplied at construction; the array never
//! inspects item contents and never runs item destructors — item lifecycle
//! belongs to the reflection functors of the owning type.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr;

#[repr(C)]
pub struct DynamicArray {
    data: *mut u8,
    size: u32,
    capacity: u32,
    item_size: u32,
    item_alignment: u32,
}

// Raw storage only; the owning record synchronizes access.
unsafe impl Send for DynamicArray {}
unsafe impl Sync for DynamicArray {}

impl DynamicArray {
    pub fn new(item_size: u32, item_alignment: u32) -> Self {
        assert!(item_size > 0, "dynamic array items must have non-zero size");
        assert!(
            item_alignment.is_power_of_two(),
            "dynamic array item alignment must be a power of two"
        );
        DynamicArray {
            data: ptr::null_mut(),
            size: 0,
            capacity: 0,
            item_size,
            item_alignment,
        }
    }

    pub fn with_capacity(item_size: u32, item_alignment: u32, capacity: u32) -> Self {
        let mut array = DynamicArray::new(item_size, item_alignment);
        array.reserve(capacity);
        array
    }

    pub fn len(&self) -> u32 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn item_size(&self) -> u32 {
        self.item_size
    }

    pub fn item_alignment(&self) -> u32 {
        self.item_alignment
    }

    fn layout_for(&self, capacity: u32) -> Layout {
        Layout::from_size_align(
            (self.item_size as usize * capacity as usize).max(1),
            self.item_alignment as usize,
        )
        .expect("dynamic array layout")
    }

    pub fn reserve(&mut self, capacity: u32) {
        if capacity <= self.capacity {
            return;
        }

        unsafe {
            let new_data = alloc_zeroed(self.layout_for(capacity));
            if !self.data.is_null() {
                ptr::copy_nonoverlapping(
                    self.data,
                    new_data,
                    self.item_size as usize * self.size as usize,
                );
                dealloc(self.data, self.layout_for(self.capacity));
            }

            self.data = new_data;
            self.capacity = capacity;
        }
    }

    /// Appends a zero-initialized item and returns its address.
    pub fn push_zeroed(&mut self) -> *mut u8 {
        if self.size == self.capacity {
            let grown = if self.capacity == 0 { 4 } else { self.capacity * 2 };
            self.reserve(grown);
        }

        let item = unsafe { self.data.add(self.item_size as usize * self.size as usize) };
        self.size += 1;
        item
    }

    pub fn item_ptr(&self, index: u32) -> *mut u8 {
        assert!(index < self.size, "dynamic array index out of range");
        unsafe { self.data.add(self.item_size as usize * index as usize) }
    }

    /// Truncation only; growing the logical size goes through `push_zeroed`.
    pub fn set_len(&mut self, len: u32) {
        assert!(len <= self.size, "dynamic array cannot be lengthened by set_len");
        self.size = len;
    }

    pub fn shutdown(&mut self) {
        if !self.data.is_null() {
            unsafe {
                dealloc(self.data, self.layout_for(self.capacity));
            }
            self.data = ptr::null_mut();
        }

        self.size = 0;
        self.capacity = 0;
    }
}

impl Drop for DynamicArray {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_read_back() {
        let mut array = DynamicArray::new(8, 8);
        for value in 0u64..12 {
            let slot = array.push_zeroed() as *mut u64;
            unsafe { slot.write(value) };
        }

        assert_eq!(array.len(), 12);
        for index in 0..12u32 {
            let value = unsafe { (array.item_ptr(index) as *const u64).read() };
            assert_eq!(value, index as u64);
        }
    }

    #[test]
    fn reserve_preserves_items() {
        let mut array = DynamicArray::with_capacity(4, 4, 2);
        unsafe { (array.push_zeroed() as *mut u32).write(41) };
        array.reserve(64);
        let value = unsafe { (array.item_ptr(0) as *const u32).read() };
        assert_eq!(value, 41);
        assert_eq!(array.capacity(), 64);
    }

    #[test]
    fn push_zeroed_is_zeroed() {
        let mut array = DynamicArray::new(8, 8);
        for _ in 0..5 {
            let value = unsafe { (array.push_zeroed() as *const u64).read() };
            assert_eq!(value, 0);
        }
    }
}

use std::alloc;
use std::fmt;

/// Alignment of every tensor buffer, in bytes. Wide enough for 128-bit SIMD
/// loads of any supported datum type.
pub const BUFFER_ALIGNMENT: usize = 16;

/// Raw, aligned, heap-allocated byte storage backing a `Tensor`.
///
/// A buffer can be detached from its tensor (`Tensor::into_buffer`) and
/// reattached later (`Tensor::from_buffer`), which is what pooling
/// allocators do to recycle storage.
pub struct Buffer {
    layout: alloc::Layout,
    data: *mut u8,
}

unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    fn layout_for(len: usize) -> alloc::Layout {
        match alloc::Layout::from_size_align(len, BUFFER_ALIGNMENT) {
            Ok(layout) => layout,
            Err(_) => panic!("capacity overflow allocating {len} bytes"),
        }
    }

    fn allocate(len: usize, zeroed: bool) -> Buffer {
        let layout = Self::layout_for(len);
        if len == 0 {
            return Buffer { layout, data: std::ptr::without_provenance_mut(BUFFER_ALIGNMENT) };
        }
        let data = unsafe {
            if zeroed {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        if data.is_null() {
            alloc::handle_alloc_error(layout)
        }
        Buffer { layout, data }
    }

    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Buffer {
        Self::allocate(len, true)
    }

    /// Allocate `len` bytes without initializing them.
    ///
    /// # Safety
    ///
    /// Content must be written before being read.
    pub unsafe fn uninitialized(len: usize) -> Buffer {
        Self::allocate(len, false)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.layout.size()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the whole buffer with zeros.
    pub fn clear(&mut self) {
        if self.len() > 0 {
            unsafe { std::ptr::write_bytes(self.data, 0, self.len()) }
        }
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.data
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.data, self.len()) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len()) }
    }
}

impl Clone for Buffer {
    fn clone(&self) -> Buffer {
        let mut other = unsafe { Buffer::uninitialized(self.len()) };
        other.as_bytes_mut().copy_from_slice(self.as_bytes());
        other
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if self.layout.size() > 0 {
            unsafe { alloc::dealloc(self.data, self.layout) }
        }
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Buffer({} bytes)", self.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_and_zeroed() {
        for len in [0, 1, 3, 16, 17, 1000] {
            let b = Buffer::zeroed(len);
            assert_eq!(b.as_ptr() as usize % BUFFER_ALIGNMENT, 0);
            assert_eq!(b.len(), len);
            assert!(b.as_bytes().iter().all(|&x| x == 0));
        }
    }

    #[test]
    fn clear_after_write() {
        let mut b = Buffer::zeroed(8);
        b.as_bytes_mut()[3] = 7;
        let c = b.clone();
        assert_eq!(c.as_bytes()[3], 7);
        b.clear();
        assert!(b.as_bytes().iter().all(|&x| x == 0));
    }
}

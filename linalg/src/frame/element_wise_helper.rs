use crate::LADatum;
use std::alloc::*;

/// Run `f` over `vec`, handing it only slices that start on an
/// `alignment_bytes` boundary and whose length is a multiple of `nr`.
/// Misaligned head and ragged tail go through a thread-local scratch tile.
pub(crate) fn map_slice_with_alignment<T>(
    vec: &mut [T],
    f: impl Fn(&mut [T]),
    nr: usize,
    alignment_bytes: usize,
) where
    T: LADatum,
{
    if vec.is_empty() {
        return;
    }
    TMP.with(|buffer| {
        let mut buffer = buffer.borrow_mut();
        buffer.ensure(nr * T::datum_type().size_of(), alignment_bytes);
        let tmp = unsafe { std::slice::from_raw_parts_mut(buffer.buffer as *mut T, nr) };
        let mut compute_via_temp_buffer = |slice: &mut [T]| {
            tmp[..slice.len()].copy_from_slice(slice);
            tmp[slice.len()..].fill(T::zero());
            f(tmp);
            slice.copy_from_slice(&tmp[..slice.len()])
        };
        let prefix_len = vec.as_ptr().align_offset(alignment_bytes).min(vec.len());
        if prefix_len > 0 {
            compute_via_temp_buffer(&mut vec[..prefix_len]);
        }
        let aligned_len = (vec.len() - prefix_len) / nr * nr;
        if aligned_len > 0 {
            f(&mut vec[prefix_len..][..aligned_len]);
        }
        if prefix_len + aligned_len < vec.len() {
            compute_via_temp_buffer(&mut vec[prefix_len + aligned_len..]);
        }
    })
}

std::thread_local! {
    static TMP: std::cell::RefCell<TempBuffer> = std::cell::RefCell::new(TempBuffer::default());
}

/// Growable aligned scratch space, reused across calls on a thread.
pub struct TempBuffer {
    pub layout: Layout,
    pub buffer: *mut u8,
}

impl Default for TempBuffer {
    fn default() -> Self {
        TempBuffer { layout: Layout::new::<()>(), buffer: std::ptr::null_mut() }
    }
}

impl TempBuffer {
    pub fn ensure(&mut self, size: usize, alignment: usize) {
        if size > self.layout.size() || alignment > self.layout.align() {
            let size = size.max(self.layout.size());
            let alignment = alignment.max(self.layout.align());
            unsafe {
                if !self.buffer.is_null() {
                    dealloc(self.buffer, self.layout);
                }
                self.layout = Layout::from_size_align_unchecked(size, alignment);
                self.buffer = alloc(self.layout);
            }
            if self.buffer.is_null() {
                handle_alloc_error(self.layout)
            }
        }
    }
}

impl Drop for TempBuffer {
    fn drop(&mut self) {
        if !self.buffer.is_null() {
            unsafe { dealloc(self.buffer, self.layout) }
        }
    }
}

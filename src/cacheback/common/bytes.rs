use bytes::{BytesMut, BufMut};

/// Exposes the uninitialized tail of a BytesMut as a mutable slice so it can be
/// filled in-place by a raw recv() before advancing len via set_len/advance_mut.
///
/// # Safety
/// The caller must not read from the returned slice before writing fully
/// initialized bytes into the portion it intends to commit with `advance_mut`.
pub unsafe fn bytes_to_slice_mut(buf: &mut BytesMut) -> &mut [u8] {
    let maybe_uninit = buf.chunk_mut();
    std::slice::from_raw_parts_mut(maybe_uninit.as_mut_ptr(), maybe_uninit.len())
}

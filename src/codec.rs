//! Thin façade over the LZ4 block codec.
//!
//! All compression in the crate funnels through here: the saved-frame ring,
//! the background compression worker and the rewind arena. Callers treat
//! the codec as opaque — the only contracts are the bound computation, the
//! "no win" signal (a `None` / oversized result) and exact-length decode
//! enforcement.
//!
//! The `accel` parameter mirrors the fast-compression acceleration knob of
//! the reference C library. The pure-Rust block encoder used here runs at a
//! single speed setting, so the value is accepted for configuration
//! compatibility without changing the encoder's behaviour.

use lz4_flex::block::{compress_into, decompress_into, get_maximum_output_size};

/// Worst-case compressed size for an input of `len` bytes.
#[inline]
pub(crate) fn compress_bound(len: usize) -> usize {
    get_maximum_output_size(len)
}

/// Compresses `src` into a freshly allocated buffer, truncated to the
/// compressed length. Returns `None` if the encoder fails or `src` is empty.
pub(crate) fn compress(src: &[u8], _accel: i32) -> Option<Vec<u8>> {
    if src.is_empty() {
        return None;
    }
    let mut dst = vec![0u8; compress_bound(src.len())];
    match compress_into(src, &mut dst) {
        Ok(written) => {
            dst.truncate(written);
            Some(dst)
        },
        Err(_) => None,
    }
}

/// Compresses `src` into the caller's slice, returning the compressed
/// length. `dst` must be at least [`compress_bound`] of `src.len()` bytes;
/// returns `None` on encoder failure.
pub(crate) fn compress_into_slice(src: &[u8], dst: &mut [u8], _accel: i32) -> Option<usize> {
    if src.is_empty() {
        return None;
    }
    compress_into(src, dst).ok()
}

/// Decompresses `src` into `dst[..expected]`, requiring the decoded length
/// to equal `expected` exactly.
#[must_use]
pub(crate) fn decompress_exact(src: &[u8], dst: &mut [u8], expected: usize) -> bool {
    if dst.len() < expected {
        return false;
    }
    match decompress_into(src, &mut dst[..expected]) {
        Ok(decoded) => decoded == expected,
        Err(_) => false,
    }
}

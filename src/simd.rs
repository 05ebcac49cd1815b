//! Byte-wise XOR and copy kernels with one-shot runtime dispatch.
//!
//! Three tiers per operation: a scalar byte loop, a 16-byte-word loop and a
//! 32-byte-word loop (one or two `u128`s per iteration — the widths the
//! optimizer lowers to SSE2/AVX2 vector moves where available). The crate
//! forbids `unsafe`, so the tiers are expressed as word-chunk loops rather
//! than intrinsics; selection still happens once per process, keyed on
//! detected CPU features, and the published table is read without
//! synchronization afterwards.

use std::sync::OnceLock;

type XorInPlaceFn = fn(&mut [u8], &[u8]);
type XorIntoFn = fn(&mut [u8], &[u8], &[u8]);
type CopyFn = fn(&mut [u8], &[u8]);

struct Kernels {
    xor_in_place: XorInPlaceFn,
    xor_into: XorIntoFn,
    copy: CopyFn,
}

static KERNELS: OnceLock<Kernels> = OnceLock::new();

const WORD16: usize = 16;
const WORD32: usize = 32;

// --- scalar tier ---

fn xor_in_place_scalar(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

fn xor_into_scalar(dst: &mut [u8], lhs: &[u8], rhs: &[u8]) {
    for ((d, l), r) in dst.iter_mut().zip(lhs.iter()).zip(rhs.iter()) {
        *d = *l ^ *r;
    }
}

fn copy_scalar(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

// --- 16-byte-word tier ---

fn load16(chunk: &[u8]) -> u128 {
    let mut word = [0u8; WORD16];
    word.copy_from_slice(chunk);
    u128::from_ne_bytes(word)
}

fn xor_in_place_w16(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);
    let mut d_chunks = dst.chunks_exact_mut(WORD16);
    let mut s_chunks = src.chunks_exact(WORD16);
    for (d, s) in d_chunks.by_ref().zip(s_chunks.by_ref()) {
        let word = load16(d) ^ load16(s);
        d.copy_from_slice(&word.to_ne_bytes());
    }
    xor_in_place_scalar(d_chunks.into_remainder(), s_chunks.remainder());
}

fn xor_into_w16(dst: &mut [u8], lhs: &[u8], rhs: &[u8]) {
    let n = dst.len().min(lhs.len()).min(rhs.len());
    let (dst, lhs, rhs) = (&mut dst[..n], &lhs[..n], &rhs[..n]);
    let mut d_chunks = dst.chunks_exact_mut(WORD16);
    let mut l_chunks = lhs.chunks_exact(WORD16);
    let mut r_chunks = rhs.chunks_exact(WORD16);
    for ((d, l), r) in d_chunks
        .by_ref()
        .zip(l_chunks.by_ref())
        .zip(r_chunks.by_ref())
    {
        let word = load16(l) ^ load16(r);
        d.copy_from_slice(&word.to_ne_bytes());
    }
    xor_into_scalar(
        d_chunks.into_remainder(),
        l_chunks.remainder(),
        r_chunks.remainder(),
    );
}

// --- 32-byte-word tier ---

fn xor_in_place_w32(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    let (dst, src) = (&mut dst[..n], &src[..n]);
    let mut d_chunks = dst.chunks_exact_mut(WORD32);
    let mut s_chunks = src.chunks_exact(WORD32);
    for (d, s) in d_chunks.by_ref().zip(s_chunks.by_ref()) {
        let lo = load16(&d[..WORD16]) ^ load16(&s[..WORD16]);
        let hi = load16(&d[WORD16..]) ^ load16(&s[WORD16..]);
        d[..WORD16].copy_from_slice(&lo.to_ne_bytes());
        d[WORD16..].copy_from_slice(&hi.to_ne_bytes());
    }
    xor_in_place_scalar(d_chunks.into_remainder(), s_chunks.remainder());
}

fn xor_into_w32(dst: &mut [u8], lhs: &[u8], rhs: &[u8]) {
    let n = dst.len().min(lhs.len()).min(rhs.len());
    let (dst, lhs, rhs) = (&mut dst[..n], &lhs[..n], &rhs[..n]);
    let mut d_chunks = dst.chunks_exact_mut(WORD32);
    let mut l_chunks = lhs.chunks_exact(WORD32);
    let mut r_chunks = rhs.chunks_exact(WORD32);
    for ((d, l), r) in d_chunks
        .by_ref()
        .zip(l_chunks.by_ref())
        .zip(r_chunks.by_ref())
    {
        let lo = load16(&l[..WORD16]) ^ load16(&r[..WORD16]);
        let hi = load16(&l[WORD16..]) ^ load16(&r[WORD16..]);
        d[..WORD16].copy_from_slice(&lo.to_ne_bytes());
        d[WORD16..].copy_from_slice(&hi.to_ne_bytes());
    }
    xor_into_scalar(
        d_chunks.into_remainder(),
        l_chunks.remainder(),
        r_chunks.remainder(),
    );
}

// `copy_from_slice` already lowers to the platform memcpy; the wide tiers
// share one implementation.
fn copy_wide(dst: &mut [u8], src: &[u8]) {
    let n = dst.len().min(src.len());
    dst[..n].copy_from_slice(&src[..n]);
}

fn detect() -> Kernels {
    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if std::arch::is_x86_feature_detected!("avx2") {
            return Kernels {
                xor_in_place: xor_in_place_w32,
                xor_into: xor_into_w32,
                copy: copy_wide,
            };
        }
        if std::arch::is_x86_feature_detected!("sse2") {
            return Kernels {
                xor_in_place: xor_in_place_w16,
                xor_into: xor_into_w16,
                copy: copy_wide,
            };
        }
        Kernels {
            xor_in_place: xor_in_place_scalar,
            xor_into: xor_into_scalar,
            copy: copy_scalar,
        }
    }
    #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
    {
        Kernels {
            xor_in_place: xor_in_place_w16,
            xor_into: xor_into_w16,
            copy: copy_wide,
        }
    }
}

#[inline]
fn kernels() -> &'static Kernels {
    KERNELS.get_or_init(detect)
}

/// `dst[i] ^= src[i]` over the common length of the two slices.
///
/// Callers pass equal-length slices; the shorter length wins otherwise.
#[inline]
pub(crate) fn xor_in_place(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    (kernels().xor_in_place)(dst, src);
}

/// `dst[i] = lhs[i] ^ rhs[i]` over the common length of the three slices.
#[inline]
pub(crate) fn xor_into(dst: &mut [u8], lhs: &[u8], rhs: &[u8]) {
    debug_assert_eq!(dst.len(), lhs.len());
    debug_assert_eq!(lhs.len(), rhs.len());
    (kernels().xor_into)(dst, lhs, rhs);
}

/// Copies `src` into `dst` over the common length. No-op for empty slices.
#[inline]
pub(crate) fn copy_bytes(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    (kernels().copy)(dst, src);
}

// #########
// # TESTS #
// #########

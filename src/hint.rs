//! Branch prediction hints for the packet paths.

/// Marks a code path as cold (unlikely to be taken).
#[inline]
#[cold]
fn cold() {}

/// Hints to the compiler that the condition is likely true.
#[inline]
pub(crate) fn likely(b: bool) -> bool {
    if !b {
        cold()
    }
    b
}

/// Hints to the compiler that the condition is unlikely true.
#[inline]
pub(crate) fn unlikely(b: bool) -> bool {
    if b {
        cold()
    }
    b
}

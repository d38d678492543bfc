//! Wrap-around arithmetic for 32-bit sequence numbers (TSNs).
//!
//! TSNs are compared in the circular space of u32: `a` is "before" `b` when
//! the forward distance from `a` to `b` is less than half the space.

/// Forward distance from `from` to `to`, wrapping.
pub fn delta(to: u32, from: u32) -> u32 {
    to.wrapping_sub(from)
}

pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn le(a: u32, b: u32) -> bool {
    a == b || lt(a, b)
}

pub fn gt(a: u32, b: u32) -> bool {
    lt(b, a)
}

pub fn ge(a: u32, b: u32) -> bool {
    a == b || gt(a, b)
}

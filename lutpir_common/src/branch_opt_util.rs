/// Marks the enclosing path as rarely taken, nudging the optimizer's block layout.
#[cold]
#[inline(always)]
pub fn cold() {}

#[inline(always)]
pub fn likely(b: bool) -> bool {
    if !b {
        cold();
    }
    b
}

#[inline(always)]
pub fn unlikely(b: bool) -> bool {
    if b {
        cold();
    }
    b
}

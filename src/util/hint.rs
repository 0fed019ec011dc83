/// Run `f` on a path the optimizer should treat as unlikely (allocation
/// failure, first-use initialization).
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}

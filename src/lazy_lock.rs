use std::{
    cell::Cell,
    ops::Deref,
    sync::atomic::{AtomicBool, Ordering},
};

use once_cell::sync::OnceCell;

use crate::util::hint::cold;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LazyLockState {
    /// Signifies this lock is uninitialized
    Uninit,
    /// Signifies this lock is initialized
    Init,
    /// Signifies some thread is running the initializer right now
    Initializing,
}

thread_local! {
    /// Set while the current thread is inside any `LazyLock` initializer.
    static IN_INITIALIZER: Cell<bool> = const { Cell::new(false) };
}

/// Once entered, marks this thread as running the owning lock's initializer
/// until dropped, which happens after the cell is published or while
/// unwinding out of a panicking initializer.
struct InitializerGuard<'a> {
    initializing: &'a AtomicBool,
    outer: Option<bool>,
}

impl<'a> InitializerGuard<'a> {
    fn idle(initializing: &'a AtomicBool) -> Self {
        Self {
            initializing,
            outer: None,
        }
    }

    fn enter(&mut self) {
        self.initializing.store(true, Ordering::Release);
        self.outer = Some(IN_INITIALIZER.with(|flag| flag.replace(true)));
    }
}

impl Drop for InitializerGuard<'_> {
    fn drop(&mut self) {
        if let Some(outer) = self.outer {
            self.initializing.store(false, Ordering::Release);
            IN_INITIALIZER.with(|flag| flag.set(outer));
        }
    }
}

/// A lazily initialized value that lets you poll its initialization state
/// (including mid-init), and that can refuse instead of deadlocking when the
/// initializer re-enters it.
///
/// Initialization happens exactly once. Threads that race the first access
/// block until the winner is done, and never observe a half-built value.
pub struct LazyLock<T, F = fn() -> T> {
    cell: OnceCell<T>,
    initializing: AtomicBool,
    init: F,
}

impl<T, F> LazyLock<T, F>
where
    F: Fn() -> T,
{
    pub const fn new(init: F) -> Self {
        Self {
            cell: OnceCell::new(),
            initializing: AtomicBool::new(false),
            init,
        }
    }

    pub fn state(lock: &Self) -> LazyLockState {
        // The flag is cleared only after the cell is published, so reading
        // it first never reports `Uninit` for a finished lock.
        let initializing = lock.initializing.load(Ordering::Acquire);
        if lock.cell.get().is_some() {
            LazyLockState::Init
        } else if initializing {
            LazyLockState::Initializing
        } else {
            LazyLockState::Uninit
        }
    }

    /// Get the value, running the initializer if nobody has yet.
    ///
    /// Calling this from inside this lock's own initializer deadlocks, use
    /// [`LazyLock::try_initialize()`] on paths that may re-enter.
    pub fn initialize(&self) -> &T {
        if let Some(value) = self.cell.get() {
            return value;
        }
        cold(|| {
            let mut guard = InitializerGuard::idle(&self.initializing);
            self.cell.get_or_init(|| {
                guard.enter();
                (self.init)()
            })
        })
    }

    /// Like [`LazyLock::initialize()`], but returns `None` instead of
    /// deadlocking if the current thread is already running an initializer.
    pub fn try_initialize(&self) -> Option<&T> {
        if let Some(value) = self.cell.get() {
            return Some(value);
        }
        if IN_INITIALIZER.with(Cell::get) {
            return None;
        }
        Some(self.initialize())
    }
}

impl<T, F> Deref for LazyLock<T, F>
where
    F: Fn() -> T,
{
    type Target = T;

    fn deref(&self) -> &Self::Target {
        self.initialize()
    }
}

//! Diagnostics that never touch the heap.
//!
//! Anything printed from inside `allocate()`/`deallocate()` may be running
//! while this crate *is* the global allocator, so `format!` and friends are
//! off the table. [`putln!`] builds a line in a fixed stack buffer
//! and hand it straight to `write(2)`.
//!
//! ```no_run
//! use alloc_randomizer::putln;
//! putln!("reserve = ", 15usize, ", block = ", 0x1000 as *const u8);
//! ```

/// Longest line we bother to print, anything past this is truncated
pub const LINE_BUF_SIZE: usize = 256;
/// `usize::MAX` in decimal
pub const MAX_NR_CHARS_USIZE: usize = 20;

/// A line of output, assembled on the stack
pub struct Line {
    buf: [u8; LINE_BUF_SIZE],
    len: usize,
}

impl Line {
    pub const fn new() -> Self {
        Self {
            buf: [0; LINE_BUF_SIZE],
            len: 0,
        }
    }

    /// Append `bytes`, silently truncating at [`LINE_BUF_SIZE`]
    pub fn push(&mut self, bytes: &[u8]) {
        let n = bytes.len().min(LINE_BUF_SIZE - self.len);
        self.buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
        self.len += n;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Write the line to stderr
    pub fn flush(&self) {
        putstr(self.as_bytes());
    }
}

impl Default for Line {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can be appended to a [`Line`] without allocating
pub trait Put {
    fn put(&self, line: &mut Line);
}

impl Put for &str {
    fn put(&self, line: &mut Line) {
        line.push(self.as_bytes());
    }
}

impl Put for usize {
    fn put(&self, line: &mut Line) {
        write_usize(line, *self);
    }
}

impl Put for u32 {
    fn put(&self, line: &mut Line) {
        write_usize(line, *self as usize);
    }
}

impl<T> Put for *const T {
    fn put(&self, line: &mut Line) {
        write_hex(line, *self as usize);
    }
}

impl<T> Put for *mut T {
    fn put(&self, line: &mut Line) {
        write_hex(line, *self as usize);
    }
}

/// Append `n` in decimal
pub fn write_usize(line: &mut Line, mut n: usize) {
    let mut digits = [0u8; MAX_NR_CHARS_USIZE];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    line.push(&digits[i..]);
}

/// Append `n` as `0x`-prefixed lowercase hex
pub fn write_hex(line: &mut Line, mut n: usize) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut digits = [0u8; 2 * std::mem::size_of::<usize>()];
    let mut i = digits.len();
    loop {
        i -= 1;
        digits[i] = HEX[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    line.push(b"0x");
    line.push(&digits[i..]);
}

/// `write(2)` to stderr, retrying short writes. Errors are dropped: there is
/// nowhere left to report them.
pub fn putstr(s: &[u8]) {
    let mut rest = s;
    while !rest.is_empty() {
        // SAFETY: `rest` is an initialized buffer valid for `rest.len()` bytes
        let n = unsafe { libc::write(libc::STDERR_FILENO, rest.as_ptr().cast(), rest.len()) };
        if n <= 0 {
            return;
        }
        rest = &rest[n as usize..];
    }
}

/// Print the arguments back to back on stderr, followed by a newline
#[macro_export]
macro_rules! putln {
    ($($arg:expr),* $(,)?) => {{
        let mut line = $crate::util::print::Line::new();
        $( $crate::util::print::Put::put(&$arg, &mut line); )*
        line.push(b"\n");
        line.flush();
    }};
}

//! Process-wide knobs for the randomizer.
//!
//! A [`Config`] is a handful of atomics, so it can be read from any number of
//! allocating threads without ever observing a torn value. That does *not*
//! make changing it while allocations are in flight meaningful: the setters
//! are meant for a single-threaded setup phase (test fixtures, `main()`),
//! before allocation traffic starts. Racing a setter against allocations is
//! the caller's problem; each allocation simply sees either the old or the
//! new value.
//!
//! # Environment
//!
//! | variable                        | meaning                               |
//! |---------------------------------|---------------------------------------|
//! | `ALLOC_RANDOMIZER_ALIGN_BITS`   | returned pointers are `2^n` aligned   |
//! | `ALLOC_RANDOMIZER_RANDOM_BITS`  | `n` bits of entropy in block offsets  |
//! | `ALLOC_RANDOMIZER_SEED`         | fixed seed, otherwise drawn from OS   |
//! | `ALLOC_RANDOMIZER_TRACE`        | `1` to print every placement          |
//!
//! Variables are read with `getenv(3)` directly, because the first read may
//! happen inside the very first allocation of the process.

use std::{
    ffi::CStr,
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::alloc::entropy::Entropy;

/// Largest accepted value for either exponent. Keeps `2^bits` (and a little
/// headroom for the header) representable in a `usize`.
pub const MAX_BITS: u32 = usize::BITS - 2;

/// Seed used when nothing better is available
pub const DEFAULT_SEED: u64 = 0x243f_6a88_85a3_08d3;

pub const ALIGN_BITS_VAR: &CStr = c"ALLOC_RANDOMIZER_ALIGN_BITS";
pub const RANDOM_BITS_VAR: &CStr = c"ALLOC_RANDOMIZER_RANDOM_BITS";
pub const SEED_VAR: &CStr = c"ALLOC_RANDOMIZER_SEED";
pub const TRACE_VAR: &CStr = c"ALLOC_RANDOMIZER_TRACE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var}: `{value}` is not a valid number")]
    InvalidNumber { var: &'static str, value: String },
    #[error("{var}: `{value}` is not a valid flag (expected 1/0, true/false, yes/no, on/off)")]
    InvalidFlag { var: &'static str, value: String },
    #[error("{var}: {bits} bits is more than the maximum of {max}")]
    TooManyBits {
        var: &'static str,
        bits: u32,
        max: u32,
    },
}

/// A plain copy of a [`Config`] at some point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub align_bits: u32,
    pub random_bits: u32,
    pub trace: bool,
    pub seed: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            align_bits: 0,
            random_bits: 0,
            trace: false,
            seed: DEFAULT_SEED,
        }
    }
}

#[derive(Debug)]
pub struct Config {
    align_bits: AtomicU32,
    random_bits: AtomicU32,
    trace: AtomicBool,
    /// Seeded once at construction. Randomizers sharing a seed place
    /// blocks identically for the same sequence of calls.
    entropy: Entropy,
}

impl Config {
    /// No alignment beyond what the underlying allocator gives, no
    /// randomization, no tracing.
    pub const fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    pub const fn with_seed(seed: u64) -> Self {
        Self {
            align_bits: AtomicU32::new(0),
            random_bits: AtomicU32::new(0),
            trace: AtomicBool::new(false),
            entropy: Entropy::new(seed),
        }
    }

    /// # Panics
    ///
    /// If either exponent is above [`MAX_BITS`]
    pub fn from_settings(settings: Settings) -> Self {
        let config = Self::with_seed(settings.seed);
        config.set_align_bits(settings.align_bits);
        config.set_random_bits(settings.random_bits);
        config.set_trace(settings.trace);
        config
    }

    /// Build a config from the process environment, failing on the first
    /// malformed variable.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(getenv)
    }

    /// Like [`Config::from_env()`], but a malformed variable is logged and
    /// replaced by its default instead of failing the whole config. This is
    /// what the global randomizer uses, since there is nobody to hand an
    /// error to during the first allocation of a process.
    pub fn from_env_or_default() -> Self {
        Self::from_lookup_lenient(getenv)
    }

    /// [`Config::from_env()`] against an arbitrary variable source
    pub fn from_lookup<'a, L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&'static CStr) -> Option<&'a [u8]>,
    {
        let seed = parse_var(&lookup, SEED_VAR, parse_u64)?.unwrap_or_else(os_seed);
        let config = Self::with_seed(seed);
        if let Some(bits) = parse_var(&lookup, ALIGN_BITS_VAR, parse_bits)? {
            config.set_align_bits(bits);
        }
        if let Some(bits) = parse_var(&lookup, RANDOM_BITS_VAR, parse_bits)? {
            config.set_random_bits(bits);
        }
        if let Some(trace) = parse_var(&lookup, TRACE_VAR, parse_flag)? {
            config.set_trace(trace);
        }
        Ok(config)
    }

    /// [`Config::from_env_or_default()`] against an arbitrary variable source
    pub fn from_lookup_lenient<'a, L>(lookup: L) -> Self
    where
        L: Fn(&'static CStr) -> Option<&'a [u8]>,
    {
        fn lenient<T>(result: Result<Option<T>, ConfigError>) -> Option<T> {
            result.unwrap_or_else(|err| {
                log::warn!("ignoring malformed setting: {err}");
                None
            })
        }

        let seed = lenient(parse_var(&lookup, SEED_VAR, parse_u64)).unwrap_or_else(os_seed);
        let config = Self::with_seed(seed);
        if let Some(bits) = lenient(parse_var(&lookup, ALIGN_BITS_VAR, parse_bits)) {
            config.set_align_bits(bits);
        }
        if let Some(bits) = lenient(parse_var(&lookup, RANDOM_BITS_VAR, parse_bits)) {
            config.set_random_bits(bits);
        }
        if let Some(trace) = lenient(parse_var(&lookup, TRACE_VAR, parse_flag)) {
            config.set_trace(trace);
        }
        config
    }

    pub fn align_bits(&self) -> u32 {
        self.align_bits.load(Ordering::Relaxed)
    }

    pub fn random_bits(&self) -> u32 {
        self.random_bits.load(Ordering::Relaxed)
    }

    pub fn trace(&self) -> bool {
        self.trace.load(Ordering::Relaxed)
    }

    pub const fn seed(&self) -> u64 {
        self.entropy.seed()
    }

    /// The offset source seeded from [`Config::seed()`]
    pub fn entropy(&self) -> &Entropy {
        &self.entropy
    }

    /// Make every subsequently returned pointer `2^bits` aligned. `0` means
    /// "whatever the underlying allocator gives".
    ///
    /// # Panics
    ///
    /// If `bits > MAX_BITS`. Such an alignment cannot be expressed in a
    /// pointer, so this is a caller bug rather than an allocation failure.
    pub fn set_align_bits(&self, bits: u32) {
        assert!(
            bits <= MAX_BITS,
            "align_bits = {bits} is more than the maximum of {MAX_BITS}"
        );
        self.align_bits.store(bits, Ordering::Relaxed);
    }

    /// Choose the offset of every subsequent block among `2^bits` candidate
    /// positions.
    ///
    /// # Panics
    ///
    /// If `bits > MAX_BITS`
    pub fn set_random_bits(&self, bits: u32) {
        assert!(
            bits <= MAX_BITS,
            "random_bits = {bits} is more than the maximum of {MAX_BITS}"
        );
        self.random_bits.store(bits, Ordering::Relaxed);
    }

    pub fn set_trace(&self, trace: bool) {
        self.trace.store(trace, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Settings {
        Settings {
            align_bits: self.align_bits(),
            random_bits: self.random_bits(),
            trace: self.trace(),
            seed: self.seed(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// `getenv(3)`, which hands out a pointer into the environment block rather
/// than allocating like `std::env::var()` does.
fn getenv(var: &'static CStr) -> Option<&'static [u8]> {
    // SAFETY: `var` is NUL-terminated. The returned pointer, if non-null,
    // points into the environment, which we never modify.
    let value = unsafe { libc::getenv(var.as_ptr()) };
    if value.is_null() {
        None
    } else {
        // SAFETY: non-null results of `getenv()` are NUL-terminated strings
        Some(unsafe { CStr::from_ptr(value) }.to_bytes())
    }
}

fn os_seed() -> u64 {
    let mut seed = [0u8; 8];
    match OsRng.try_fill_bytes(&mut seed) {
        Ok(()) => u64::from_ne_bytes(seed),
        Err(_) => DEFAULT_SEED,
    }
}

fn var_name(var: &'static CStr) -> &'static str {
    var.to_str().unwrap_or("<non-utf8 variable>")
}

fn parse_var<'a, L, T>(
    lookup: &L,
    var: &'static CStr,
    parse: fn(&'static str, &str) -> Result<T, ConfigError>,
) -> Result<Option<T>, ConfigError>
where
    L: Fn(&'static CStr) -> Option<&'a [u8]>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let name = var_name(var);
    let text = std::str::from_utf8(raw).map_err(|_| ConfigError::InvalidNumber {
        var: name,
        value: String::from_utf8_lossy(raw).into_owned(),
    })?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    parse(name, text).map(Some)
}

fn parse_u64(var: &'static str, text: &str) -> Result<u64, ConfigError> {
    text.parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: text.to_owned(),
    })
}

fn parse_bits(var: &'static str, text: &str) -> Result<u32, ConfigError> {
    let bits: u32 = text.parse().map_err(|_| ConfigError::InvalidNumber {
        var,
        value: text.to_owned(),
    })?;
    if bits > MAX_BITS {
        return Err(ConfigError::TooManyBits {
            var,
            bits,
            max: MAX_BITS,
        });
    }
    Ok(bits)
}

fn parse_flag(var: &'static str, text: &str) -> Result<bool, ConfigError> {
    let is = |options: &[&str]| options.iter().any(|o| text.eq_ignore_ascii_case(o));
    if is(&["1", "true", "yes", "on"]) {
        Ok(true)
    } else if is(&["0", "false", "no", "off"]) {
        Ok(false)
    } else {
        Err(ConfigError::InvalidFlag {
            var,
            value: text.to_owned(),
        })
    }
}

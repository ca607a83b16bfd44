//! Time and randomness abstraction
//!
//! TigerStyle: Every read of the clock and every random draw goes through a
//! provider trait, so the registry runs identically against the wall clock
//! in production and a manually advanced clock in tests.
//!
//! ```text
//!   registry components
//!          │
//!   ┌──────▼───────────────────────┐
//!   │ TimeProvider, RngProvider    │
//!   └──────┬───────────────┬───────┘
//!          │               │
//!   WallClockTime     ManualClock
//!   StdRngProvider    StdRngProvider::with_seed
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Time Provider
// ============================================================================

/// Source of the current time for registry components
///
/// Components must not call `SystemTime::now()` directly.
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Current time in milliseconds since the Unix epoch
    fn now_ms(&self) -> u64;

    /// Sleep for the given number of milliseconds
    async fn sleep_ms(&self, ms: u64);

    /// Monotonic timestamp for measuring durations
    fn monotonic_ms(&self) -> u64 {
        self.now_ms()
    }
}

/// Production time provider backed by the system clock
#[derive(Debug, Clone, Default)]
pub struct WallClockTime;

impl WallClockTime {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for WallClockTime {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    async fn sleep_ms(&self, ms: u64) {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }
}

/// Clock that only moves when told to
///
/// Used by tests to drive breaker timeouts, retry backoff and retention
/// windows without waiting on real time.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Create a clock starting at `initial_ms`
    pub fn new(initial_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(initial_ms),
        }
    }

    /// Move the clock forward by `ms`
    pub fn advance_ms(&self, ms: u64) {
        let previous = self.now_ms.fetch_add(ms, Ordering::SeqCst);
        debug_assert!(previous.checked_add(ms).is_some(), "clock overflow");
    }

    /// Jump the clock to an absolute time
    pub fn set_ms(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

#[async_trait]
impl TimeProvider for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    async fn sleep_ms(&self, ms: u64) {
        self.advance_ms(ms);
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// RNG Provider
// ============================================================================

/// Source of randomness for registry components
///
/// Not cryptographically secure. Used for load balancing choices only.
pub trait RngProvider: Send + Sync + std::fmt::Debug {
    /// Generate a random u64
    fn next_u64(&self) -> u64;

    /// Generate a random f64 in [0, 1)
    fn next_f64(&self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Generate a random u64 in [min, max)
    fn gen_range(&self, min: u64, max: u64) -> u64 {
        assert!(min < max, "min must be less than max");
        min + (self.next_u64() % (max - min))
    }

    /// Pick a uniformly random index into a collection of `len` items
    fn choose_index(&self, len: usize) -> usize {
        assert!(len > 0, "cannot choose from an empty collection");
        self.gen_range(0, len as u64) as usize
    }
}

/// Xorshift RNG over an atomic state word
#[derive(Debug)]
pub struct StdRngProvider {
    state: AtomicU64,
}

impl Default for StdRngProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl StdRngProvider {
    /// Create a provider seeded from the system clock
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9E37_79B9_7F4A_7C15);
        Self::with_seed(seed)
    }

    /// Create a provider with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        // xorshift has a fixed point at zero
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }
}

impl RngProvider for StdRngProvider {
    fn next_u64(&self) -> u64 {
        let mut current = self.state.load(Ordering::Relaxed);
        loop {
            let mut x = current;
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;

            match self
                .state
                .compare_exchange_weak(current, x, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return x.wrapping_mul(0x2545_F491_4F6C_DD1D),
                Err(observed) => current = observed,
            }
        }
    }
}

// ============================================================================
// I/O Context
// ============================================================================

/// Bundle of the providers handed to every registry component
#[derive(Clone)]
pub struct IoContext {
    pub time: Arc<dyn TimeProvider>,
    pub rng: Arc<dyn RngProvider>,
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("time", &self.time)
            .field("rng", &self.rng)
            .finish()
    }
}

impl Default for IoContext {
    fn default() -> Self {
        Self::production()
    }
}

impl IoContext {
    /// Wall clock and time-seeded RNG
    pub fn production() -> Self {
        Self {
            time: Arc::new(WallClockTime::new()),
            rng: Arc::new(StdRngProvider::new()),
        }
    }

    /// Explicit providers
    pub fn new(time: Arc<dyn TimeProvider>, rng: Arc<dyn RngProvider>) -> Self {
        Self { time, rng }
    }

    /// Manual clock plus seeded RNG, for tests
    pub fn manual(clock: Arc<ManualClock>, seed: u64) -> Self {
        Self {
            time: clock,
            rng: Arc::new(StdRngProvider::with_seed(seed)),
        }
    }

    /// Current time in milliseconds
    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wall_clock_is_after_2020() {
        let clock = WallClockTime::new();
        assert!(clock.now_ms() > 1_577_836_800_000);
    }

    #[tokio::test]
    async fn test_manual_clock_advance_and_sleep() {
        let clock = ManualClock::new(1000);
        assert_eq!(clock.now_ms(), 1000);

        clock.advance_ms(500);
        assert_eq!(clock.now_ms(), 1500);

        clock.sleep_ms(250).await;
        assert_eq!(clock.now_ms(), 1750);

        clock.set_ms(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn test_seeded_rng_is_reproducible() {
        let a = StdRngProvider::with_seed(42);
        let b = StdRngProvider::with_seed(42);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn test_zero_seed_does_not_stick() {
        let rng = StdRngProvider::with_seed(0);
        assert_ne!(rng.next_u64(), rng.next_u64());
    }

    #[test]
    fn test_choose_index_in_bounds() {
        let rng = StdRngProvider::with_seed(7);
        for _ in 0..1000 {
            assert!(rng.choose_index(3) < 3);
        }
        let f = rng.next_f64();
        assert!((0.0..1.0).contains(&f));
    }

    #[test]
    fn test_io_context_manual() {
        let clock = Arc::new(ManualClock::new(5));
        let io = IoContext::manual(clock.clone(), 1);
        clock.advance_ms(5);
        assert_eq!(io.now_ms(), 10);
    }
}

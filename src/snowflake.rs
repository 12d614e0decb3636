//! Snowflake ID generation.
//!
//! Ids are 64-bit signed integers laid out (MSB to LSB) as one unused sign
//! bit, 41 bits of milliseconds since [`EPOCH_MS`], 10 bits of worker id and
//! 12 bits of per-millisecond sequence. A generator hands out strictly
//! increasing ids as long as its clock does not move backward by more than
//! the configured tolerance.

use crate::error::{DbError, DbResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::hash::Hasher;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, warn};

/// 2025-01-01T00:00:00+08:00 in Unix milliseconds.
pub const EPOCH_MS: i64 = 1_735_660_800_000;

pub const TIMESTAMP_BITS: u32 = 41;
pub const WORKER_ID_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;

pub const MAX_WORKER_ID: u16 = (1 << WORKER_ID_BITS) - 1;
pub const MAX_SEQUENCE: u16 = (1 << SEQUENCE_BITS) - 1;
const MAX_TIMESTAMP: i64 = (1 << TIMESTAMP_BITS) - 1;

const WORKER_ID_SHIFT: u32 = SEQUENCE_BITS;
const TIMESTAMP_SHIFT: u32 = SEQUENCE_BITS + WORKER_ID_BITS;

pub const DEFAULT_ROLLBACK_TOLERANCE: Duration = Duration::from_millis(5);

/// Environment variable naming the worker id of the process-wide generator.
pub const WORKER_ID_ENV: &str = "SNOWFLAKE_WORKER_ID";

/// Millisecond time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Block for roughly `ms` milliseconds.
    fn wait(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnowflakeConfig {
    pub worker_id: u16,
    /// Backward clock jumps up to this size are waited out; larger ones fail.
    pub rollback_tolerance: Duration,
}

impl SnowflakeConfig {
    pub fn new(worker_id: u16) -> DbResult<Self> {
        if worker_id > MAX_WORKER_ID {
            return Err(DbError::invalid_configuration(format!(
                "worker id must be between 0 and {}, got {}",
                MAX_WORKER_ID, worker_id
            )));
        }
        Ok(Self {
            worker_id,
            rollback_tolerance: DEFAULT_ROLLBACK_TOLERANCE,
        })
    }

    pub fn with_rollback_tolerance(mut self, tolerance: Duration) -> Self {
        self.rollback_tolerance = tolerance;
        self
    }
}

#[derive(Debug)]
struct State {
    last_ms: i64,
    sequence: u16,
}

/// Thread-safe id generator.
pub struct Snowflake<K: Clock = SystemClock> {
    config: SnowflakeConfig,
    clock: K,
    state: Mutex<State>,
}

impl Snowflake<SystemClock> {
    pub fn new(config: SnowflakeConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }
}

impl<K: Clock> Snowflake<K> {
    pub fn with_clock(config: SnowflakeConfig, clock: K) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(State {
                last_ms: -1,
                sequence: 0,
            }),
        }
    }

    pub fn worker_id(&self) -> u16 {
        self.config.worker_id
    }

    /// Generate the next id.
    ///
    /// Never holds the lock across an await; safe to call from async tasks.
    pub fn next_id(&self) -> DbResult<i64> {
        let mut state = self.state.lock();
        let mut now = self.clock.now_ms();

        if now < state.last_ms {
            let drift = state.last_ms - now;
            let tolerance = self.config.rollback_tolerance.as_millis() as i64;
            if drift > tolerance {
                warn!(
                    drift_ms = drift,
                    tolerance_ms = tolerance,
                    "Clock moved backward beyond tolerance"
                );
                return Err(DbError::clock_moved_backward(drift));
            }
            debug!(drift_ms = drift, "Clock moved backward; waiting for it to catch up");
            while now < state.last_ms {
                self.clock.wait((state.last_ms - now) as u64);
                now = self.clock.now_ms();
            }
        }

        let sequence = if now == state.last_ms {
            if state.sequence == MAX_SEQUENCE {
                while now <= state.last_ms {
                    self.clock.wait(1);
                    now = self.clock.now_ms();
                }
                0
            } else {
                state.sequence + 1
            }
        } else {
            0
        };

        // A rejected timestamp leaves the generator state untouched.
        let elapsed = now - EPOCH_MS;
        if elapsed < 0 {
            return Err(DbError::invalid_configuration(format!(
                "system clock ({}) is earlier than the snowflake epoch ({})",
                now, EPOCH_MS
            )));
        }
        if elapsed > MAX_TIMESTAMP {
            return Err(DbError::invalid_configuration(
                "system clock is past the last timestamp representable in a snowflake id",
            ));
        }
        state.last_ms = now;
        state.sequence = sequence;

        Ok((elapsed << TIMESTAMP_SHIFT)
            | (i64::from(self.config.worker_id) << WORKER_ID_SHIFT)
            | i64::from(state.sequence))
    }
}

impl<K: Clock> std::fmt::Debug for Snowflake<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snowflake")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The components of a snowflake id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnowflakeInfo {
    pub id: i64,
    pub timestamp_ms: i64,
    pub datetime: DateTime<Utc>,
    pub worker_id: u16,
    pub sequence: u16,
}

/// Decode an id produced by any [`Snowflake`] generator.
pub fn parse(id: i64) -> DbResult<SnowflakeInfo> {
    if id < 0 {
        return Err(DbError::invalid_configuration(format!(
            "snowflake ids are non-negative, got {}",
            id
        )));
    }
    let timestamp_ms = (id >> TIMESTAMP_SHIFT) + EPOCH_MS;
    let worker_id = ((id >> WORKER_ID_SHIFT) & i64::from(MAX_WORKER_ID)) as u16;
    let sequence = (id & i64::from(MAX_SEQUENCE)) as u16;
    let datetime = DateTime::from_timestamp_millis(timestamp_ms).ok_or_else(|| {
        DbError::invalid_configuration(format!("timestamp {} is out of range", timestamp_ms))
    })?;
    Ok(SnowflakeInfo {
        id,
        timestamp_ms,
        datetime,
        worker_id,
        sequence,
    })
}

/// The process-wide generator.
///
/// Its worker id comes from `SNOWFLAKE_WORKER_ID` when set, otherwise from a
/// hash of the host name and process id.
pub fn global() -> &'static Snowflake {
    static GLOBAL: OnceLock<Snowflake> = OnceLock::new();
    GLOBAL.get_or_init(|| {
        let worker_id = worker_id_from_env(|key| std::env::var(key).ok());
        debug!(worker_id, "Initialized process-wide snowflake generator");
        Snowflake::with_clock(
            SnowflakeConfig {
                worker_id,
                rollback_tolerance: DEFAULT_ROLLBACK_TOLERANCE,
            },
            SystemClock,
        )
    })
}

/// Next id from the process-wide generator.
pub fn next_id() -> DbResult<i64> {
    global().next_id()
}

/// Resolve a worker id from `SNOWFLAKE_WORKER_ID`, falling back to the
/// host/process derivation when unset or invalid.
pub fn worker_id_from_env<F>(lookup: F) -> u16
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(WORKER_ID_ENV) {
        Some(raw) => match raw.trim().parse::<u16>() {
            Ok(id) if id <= MAX_WORKER_ID => id,
            _ => {
                warn!(value = %raw, "Ignoring invalid {}", WORKER_ID_ENV);
                derived_worker_id()
            }
        },
        None => derived_worker_id(),
    }
}

/// Worker id derived from the host name and process id.
pub fn derived_worker_id() -> u16 {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    worker_id_for(&host, std::process::id())
}

fn worker_id_for(host: &str, pid: u32) -> u16 {
    let mut hasher = Fnv1a::default();
    hasher.write(host.as_bytes());
    hasher.write_u32(pid);
    (hasher.finish() % (u64::from(MAX_WORKER_ID) + 1)) as u16
}

/// FNV-1a; stable across releases, unlike the std default hasher.
struct Fnv1a(u64);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Hasher for Fnv1a {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= u64::from(*byte);
            self.0 = self.0.wrapping_mul(0x0100_0000_01b3);
        }
    }
}

//! System-wide constants and tuning defaults.

use std::time::Duration;

// Event bus

/// Capacity of the main event bus queue.
pub const EVENT_BUS_CAPACITY: usize = 1024;

/// Capacity of each handler's private queue; events beyond this lag are shed.
pub const HANDLER_QUEUE_CAPACITY: usize = 256;

/// How long a publisher blocks on a full bus before dropping the event.
pub const BUS_PUBLISH_DEADLINE: Duration = Duration::from_millis(500);

// Queue

/// Maximum objectives held in the durable queue.
pub const MAX_QUEUE_SIZE: usize = 1000;

/// Magic header identifying a queue snapshot file.
pub const SNAPSHOT_MAGIC: &[u8; 5] = b"HEPHQ";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u16 = 1;

// Cache

/// Interval between TTL sweeps.
pub const CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

// Orchestrator

/// Interval between terminal-record cleanup passes.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Terminal task records older than this are trimmed by the cleanup loop.
pub const RECORD_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Grace period a cancelled agent call gets before it is abandoned.
pub const CANCEL_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Execution budget for tasks that carry no deadline of their own,
/// before the adaptive timeout multiplier is applied.
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(300);

// Adaptive controller strategy boundaries

/// Below this success rate the controller downshifts to Conservative.
pub const CONSERVATIVE_SUCCESS_FLOOR: f64 = 0.80;
/// Above this memory utilization the controller downshifts to Conservative.
pub const CONSERVATIVE_MEM_CEILING: f64 = 85.0;
/// Above this CPU utilization the controller downshifts to Conservative.
pub const CONSERVATIVE_CPU_CEILING: f64 = 90.0;

/// Success rate required for the Aggressive strategy.
pub const AGGRESSIVE_SUCCESS_FLOOR: f64 = 0.95;
/// Memory utilization must be below this for Aggressive.
pub const AGGRESSIVE_MEM_CEILING: f64 = 70.0;
/// CPU utilization must be below this for Aggressive.
pub const AGGRESSIVE_CPU_CEILING: f64 = 70.0;

// Backpressure

/// Ready-set size beyond which the runner pauses objective intake.
pub const BACKPRESSURE_READY_THRESHOLD: usize = 256;

/// How long the cycle runner sleeps when backpressure is detected.
pub const BACKPRESSURE_PAUSE: Duration = Duration::from_secs(2);

// Key pool

/// Consecutive hard failures (401/403) before a key is disabled.
pub const KEY_DISABLE_THRESHOLD: u32 = 3;

/// Initial cooldown applied to a key after a retryable failure.
pub const KEY_COOLDOWN_BASE: Duration = Duration::from_secs(5);

/// Cooldown growth is capped here.
pub const KEY_COOLDOWN_MAX: Duration = Duration::from_secs(300);

/// Window of recent calls used for per-key success-rate weighting.
pub const KEY_SUCCESS_WINDOW: usize = 50;

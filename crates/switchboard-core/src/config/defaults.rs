/// Default bind address for the application listener
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8765";

/// Default maximum number of concurrent application connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Default per-call timeout (milliseconds)
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Default period of the maintenance timer (milliseconds)
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Default retention of disconnected application records (seconds)
pub const DEFAULT_DISCONNECTED_RETENTION_SECS: u64 = 3_600;

/// Default bound on graceful shutdown (milliseconds)
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;

/// Default maximum length of one framed line (bytes)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

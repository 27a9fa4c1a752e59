//! Default values shared by configuration, the CLI and the store.

/// Deadline of a single backend operation (milliseconds).
pub const DEFAULT_TRANSACTION_TIMEOUT_MS: u64 = 500;

/// Deadline of the real backend open, after the liveness probe (milliseconds).
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 1000;

/// Maximum attempts of one backend call, including the first one.
pub const DEFAULT_TRANSACTION_RETRIES: u32 = 2;

/// Initial delay between two attempts (milliseconds).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 0;

/// Upper bound of the exponential backoff between attempts (milliseconds).
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 1000;

/// Liveness probe tick (milliseconds).
pub const DEFAULT_PROBE_INTERVAL_MS: u64 = 100;

/// Maximum number of liveness probe calls before giving up.
pub const DEFAULT_PROBE_MAX_ATTEMPTS: u32 = 10;

/// Database used by the CLI when none is given.
pub const DEFAULT_DATABASE: &str = "steadykv";

/// Collection used by the CLI when none is given.
pub const DEFAULT_COLLECTION: &str = "default";

/// Environment variable overriding the steadykv home directory.
pub const HOME_ENV_VAR: &str = "STEADYKV_HOME";

/// File name of the durable marker registry inside the home directory.
pub const MARKERS_FILE: &str = "clearable.json";

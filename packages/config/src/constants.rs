// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across the fleet

// Persistence
pub const FLEET_DATABASE_URL: &str = "FLEET_DATABASE_URL";

// Providers
pub const FLEET_DEFAULT_PROVIDER: &str = "FLEET_DEFAULT_PROVIDER";
pub const FLEET_SANDBOX_IMAGE: &str = "FLEET_SANDBOX_IMAGE";
pub const FLEET_MICROVM_API_URL: &str = "FLEET_MICROVM_API_URL";
pub const FLEET_MICROVM_API_KEY: &str = "FLEET_MICROVM_API_KEY";
pub const FLEET_LOCAL_SANDBOX_COMMAND: &str = "FLEET_LOCAL_SANDBOX_COMMAND";

// Sandbox lifecycle
pub const FLEET_WARM_TTL_SECS: &str = "FLEET_WARM_TTL_SECS";
pub const FLEET_IDLE_TIMEOUT_SECS: &str = "FLEET_IDLE_TIMEOUT_SECS";
pub const FLEET_SWEEP_INTERVAL_SECS: &str = "FLEET_SWEEP_INTERVAL_SECS";

// Delivery
pub const FLEET_DELIVERY_MAX_ATTEMPTS: &str = "FLEET_DELIVERY_MAX_ATTEMPTS";
pub const FLEET_DELIVERY_BASE_DELAY_MS: &str = "FLEET_DELIVERY_BASE_DELAY_MS";
pub const FLEET_DELIVERY_MAX_DELAY_MS: &str = "FLEET_DELIVERY_MAX_DELAY_MS";
pub const FLEET_SANDBOX_TOKEN: &str = "FLEET_SANDBOX_TOKEN";

// Orchestrator
pub const FLEET_POLL_INTERVAL_SECS: &str = "FLEET_POLL_INTERVAL_SECS";
pub const FLEET_DEDUP_PREFIX_CHARS: &str = "FLEET_DEDUP_PREFIX_CHARS";
pub const FLEET_MAX_NATURAL_QUESTIONS: &str = "FLEET_MAX_NATURAL_QUESTIONS";

// Logging
pub const FLEET_LOG_LEVEL: &str = "FLEET_LOG_LEVEL";
pub const RUST_LOG: &str = "RUST_LOG";

// Passed into every spawned sandbox
pub const FLEET_CALLBACK_SECRET: &str = "FLEET_CALLBACK_SECRET";
pub const FLEET_SANDBOX_ID: &str = "FLEET_SANDBOX_ID";

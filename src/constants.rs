/// Application constants

// Cache keys
pub const LEADERBOARD_KEY: &str = "leaderboard";
pub const PLAYER_STATS_PREFIX: &str = "leaderboard:stats:";
pub const MATCH_STAKES_PREFIX: &str = "match_stakes:";
pub const MATCH_STAKES_TOTAL_FIELD: &str = "total";

// Player stat hash fields
pub const STAT_TOTAL_STAKED: &str = "total_staked";
pub const STAT_GAMES_PLAYED: &str = "games_played";
pub const STAT_GAMES_WON: &str = "games_won";
pub const STAT_TOTAL_REWARDS: &str = "total_rewards";

// Fan-out topics
pub const TOPIC_MATCH_SETTLED: &str = "match:settled";
pub const TOPIC_STAKE_CONFIRMED: &str = "stake:confirmed";
pub const FANOUT_DEFAULT_CAPACITY: usize = 256;

// WebSocket configuration
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const WS_CLIENT_TIMEOUT_SECS: u64 = 60;

// Verification
pub const VERIFY_DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const VERIFY_DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const VERIFY_RETRY_BASE_MS: u64 = 250;

// Cache
pub const CACHE_DEFAULT_TIMEOUT_MS: u64 = 1_000;

// Background service intervals
pub const RECONCILE_INTERVAL_SECS: u64 = 300;

// Leaderboard query limits
pub const LEADERBOARD_DEFAULT_LIMIT: usize = 10;
pub const LEADERBOARD_MAX_LIMIT: usize = 100;

// Client sync defaults
pub const SYNC_POLL_INTERVAL_MS: u64 = 5_000;
pub const SYNC_POLL_TIMEOUT_MS: u64 = 10_000;
pub const SYNC_RETRY_COUNT: u32 = 3;
pub const SYNC_RETRY_BASE_MS: u64 = 1_000;
pub const SYNC_RETRY_CEILING_MS: u64 = 8_000;
pub const SYNC_CONFIRM_POLL_MS: u64 = 1_000;
pub const SYNC_CONFIRM_TIMEOUT_SECS: u64 = 60;
pub const SYNC_LEADERBOARD_LIMIT: usize = 10;

// Adaptive polling
pub const ADAPTIVE_MIN_INTERVAL_MS: u64 = 3_000;
pub const ADAPTIVE_MAX_INTERVAL_MS: u64 = 30_000;
pub const ADAPTIVE_SHORT_IDLE_SECS: u64 = 10;
pub const ADAPTIVE_LONG_IDLE_SECS: u64 = 60;

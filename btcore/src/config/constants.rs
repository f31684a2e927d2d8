pub const TCP_PORT: &str = "TCP_PORT";
pub const DOWNLOAD_DIRECTORY: &str = "DOWNLOAD_DIRECTORY";
pub const ENCRYPTION_POLICY: &str = "ENCRYPTION_POLICY";
pub const BLOCK_SIZE: &str = "BLOCK_SIZE";
pub const MAX_PENDING_REQUESTS_PER_PEER: &str = "MAX_PENDING_REQUESTS_PER_PEER";
pub const CHOKE_INTERVAL_SECONDS: &str = "CHOKE_INTERVAL_SECONDS";
pub const OPTIMISTIC_UNCHOKE_EVERY: &str = "OPTIMISTIC_UNCHOKE_EVERY";
pub const PEX_MIN_MESSAGE_INTERVAL_SECONDS: &str = "PEX_MIN_MESSAGE_INTERVAL_SECONDS";
pub const PEX_MAX_MESSAGE_INTERVAL_SECONDS: &str = "PEX_MAX_MESSAGE_INTERVAL_SECONDS";
pub const PEX_MIN_EVENTS_PER_MESSAGE: &str = "PEX_MIN_EVENTS_PER_MESSAGE";
pub const PEX_MAX_EVENTS_PER_MESSAGE: &str = "PEX_MAX_EVENTS_PER_MESSAGE";
pub const MAX_PEERS_PER_TORRENT: &str = "MAX_PEERS_PER_TORRENT";
pub const READ_WRITE_SECONDS_TIMEOUT: &str = "READ_WRITE_SECONDS_TIMEOUT";
pub const ENDGAME_THRESHOLD: &str = "ENDGAME_THRESHOLD";
pub const ASSIGNMENT_DEADLINE_SECONDS: &str = "ASSIGNMENT_DEADLINE_SECONDS";
pub const MAX_PIECES_PER_PEER: &str = "MAX_PIECES_PER_PEER";

/// A config file must provide at least the settings without defaults.
pub const MIN_SETTINGS: usize = 4;

pub const DEFAULT_BLOCK_SIZE: u32 = 16384;
pub const DEFAULT_MAX_PENDING_REQUESTS_PER_PEER: u32 = 10;
pub const DEFAULT_CHOKE_INTERVAL_SECONDS: u64 = 10;
pub const DEFAULT_OPTIMISTIC_UNCHOKE_EVERY: u32 = 3;
pub const DEFAULT_PEX_MIN_MESSAGE_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_PEX_MAX_MESSAGE_INTERVAL_SECONDS: u64 = 120;
pub const DEFAULT_PEX_MIN_EVENTS_PER_MESSAGE: usize = 1;
pub const DEFAULT_PEX_MAX_EVENTS_PER_MESSAGE: usize = 50;
pub const DEFAULT_ENDGAME_THRESHOLD: u32 = 5;
pub const DEFAULT_ASSIGNMENT_DEADLINE_SECONDS: u64 = 60;
pub const DEFAULT_MAX_PIECES_PER_PEER: usize = 3;

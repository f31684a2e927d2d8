use std::fs::File;
use std::io;
use std::io::BufRead;
use std::io::BufReader;
use std::str::FromStr;

use super::constants;

/// How the extended handshake advertises the `e` (encryption) flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionPolicy {
    RequirePlaintext,
    PreferPlaintext,
    PreferEncrypted,
    RequireEncrypted,
}

impl EncryptionPolicy {
    /// Value of the `e` key in the extended handshake.
    ///
    /// Both plaintext policies end at 0 and both encrypted policies at
    /// 1; the mapping keeps the last-wins semantics of the policy
    /// switch it replaces.
    pub fn handshake_flag(&self) -> u8 {
        match self {
            EncryptionPolicy::RequirePlaintext | EncryptionPolicy::PreferPlaintext => 0,
            EncryptionPolicy::PreferEncrypted | EncryptionPolicy::RequireEncrypted => 1,
        }
    }
}

impl FromStr for EncryptionPolicy {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "REQUIRE_PLAINTEXT" => Ok(EncryptionPolicy::RequirePlaintext),
            "PREFER_PLAINTEXT" => Ok(EncryptionPolicy::PreferPlaintext),
            "PREFER_ENCRYPTED" => Ok(EncryptionPolicy::PreferEncrypted),
            "REQUIRE_ENCRYPTED" => Ok(EncryptionPolicy::RequireEncrypted),
            _ => Err(()),
        }
    }
}

/// `Cfg` struct containing the config file information, previusly created with `Cfg::new`.
///
/// - `tcp_port`: port the acceptor listens on; also the `p` field of the extended handshake,
/// - `download_directory`: directory where torrent payload files live,
/// - `encryption_policy`: drives the `e` flag of the extended handshake,
/// - `block_size`: request granularity in bytes (at most 16 KiB),
/// - `max_pending_requests_per_peer`: outstanding REQUESTs kept per connection,
/// - `choke_interval_seconds`: period of the choker tick,
/// - `optimistic_unchoke_every`: every how many ticks an optimistic unchoke happens,
/// - `pex_*`: rate and size limits of PEX gossip messages,
/// - `max_peers_per_torrent`: maximum number of simultaneous peers per torrent,
/// - `read_write_seconds_timeout`: socket read/write timeout in seconds,
/// - `endgame_threshold`: remaining-piece count under which endgame duplication starts,
/// - `assignment_deadline_seconds`: time a peer gets to deliver an assigned piece,
/// - `max_pieces_per_peer`: active pieces assigned to one peer at a time,
#[derive(Debug, Clone)]
pub struct Cfg {
    pub tcp_port: u16,
    pub download_directory: String,
    pub encryption_policy: EncryptionPolicy,
    pub block_size: u32,
    pub max_pending_requests_per_peer: u32,
    pub choke_interval_seconds: u64,
    pub optimistic_unchoke_every: u32,
    pub pex_min_message_interval_seconds: u64,
    pub pex_max_message_interval_seconds: u64,
    pub pex_min_events_per_message: usize,
    pub pex_max_events_per_message: usize,
    pub max_peers_per_torrent: u32,
    pub read_write_seconds_timeout: u64,
    pub endgame_threshold: u32,
    pub assignment_deadline_seconds: u64,
    pub max_pieces_per_peer: usize,
}

impl Cfg {
    /// Builds a Cfg struct containing the config file information by the given path.
    /// The format of the config file must be: {config_name}={config_value} (without brackets).
    ///
    /// It returns an io::Error if:
    /// - The path to the config file does not exist or could not be open/readed.
    /// - The config file has wrong format.
    /// - A wrong config_name was in the config file.
    /// - A numeric setting is not a valid number.
    /// - ENCRYPTION_POLICY names an unknown policy.
    /// - Minimum number of correct settings were not reached.
    /// - Cross-field validation failed (PEX min interval above max, zero block size,
    ///   zero choke interval, block size above 16 KiB).
    pub fn new(path: &str) -> io::Result<Self> {
        let mut cfg = Self {
            tcp_port: 0,
            download_directory: String::from(""),
            encryption_policy: EncryptionPolicy::PreferPlaintext,
            block_size: constants::DEFAULT_BLOCK_SIZE,
            max_pending_requests_per_peer: constants::DEFAULT_MAX_PENDING_REQUESTS_PER_PEER,
            choke_interval_seconds: constants::DEFAULT_CHOKE_INTERVAL_SECONDS,
            optimistic_unchoke_every: constants::DEFAULT_OPTIMISTIC_UNCHOKE_EVERY,
            pex_min_message_interval_seconds: constants::DEFAULT_PEX_MIN_MESSAGE_INTERVAL_SECONDS,
            pex_max_message_interval_seconds: constants::DEFAULT_PEX_MAX_MESSAGE_INTERVAL_SECONDS,
            pex_min_events_per_message: constants::DEFAULT_PEX_MIN_EVENTS_PER_MESSAGE,
            pex_max_events_per_message: constants::DEFAULT_PEX_MAX_EVENTS_PER_MESSAGE,
            max_peers_per_torrent: 0,
            read_write_seconds_timeout: 0,
            endgame_threshold: constants::DEFAULT_ENDGAME_THRESHOLD,
            assignment_deadline_seconds: constants::DEFAULT_ASSIGNMENT_DEADLINE_SECONDS,
            max_pieces_per_peer: constants::DEFAULT_MAX_PIECES_PER_PEER,
        };

        let file = File::open(path)?;
        let reader = BufReader::new(file);

        let mut settings_loaded = 0;

        for line in reader.lines() {
            let current_line = line?;
            let setting: Vec<&str> = current_line.split('=').collect();

            if setting.len() != 2 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config input: {}", current_line),
                ));
            }
            cfg = Self::load_setting(cfg, setting[0], setting[1])?;
            settings_loaded += 1;
        }
        if settings_loaded < constants::MIN_SETTINGS {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Minimum number of correct settings were not reached: {}",
                    settings_loaded
                ),
            ));
        }
        cfg.validate()?;
        Ok(cfg)
    }

    fn load_setting(mut self, name: &str, value: &str) -> io::Result<Self> {
        match name {
            constants::TCP_PORT => {
                self.tcp_port = self.parse_value(value, constants::TCP_PORT)?;
            }
            constants::DOWNLOAD_DIRECTORY => self.download_directory = String::from(value),

            constants::ENCRYPTION_POLICY => match EncryptionPolicy::from_str(value) {
                Ok(policy) => self.encryption_policy = policy,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("Invalid encryption policy: {}", value),
                    ))
                }
            },

            constants::BLOCK_SIZE => {
                self.block_size = self.parse_value(value, constants::BLOCK_SIZE)?;
            }

            constants::MAX_PENDING_REQUESTS_PER_PEER => {
                self.max_pending_requests_per_peer =
                    self.parse_value(value, constants::MAX_PENDING_REQUESTS_PER_PEER)?;
            }

            constants::CHOKE_INTERVAL_SECONDS => {
                self.choke_interval_seconds =
                    self.parse_value(value, constants::CHOKE_INTERVAL_SECONDS)?;
            }

            constants::OPTIMISTIC_UNCHOKE_EVERY => {
                self.optimistic_unchoke_every =
                    self.parse_value(value, constants::OPTIMISTIC_UNCHOKE_EVERY)?;
            }

            constants::PEX_MIN_MESSAGE_INTERVAL_SECONDS => {
                self.pex_min_message_interval_seconds =
                    self.parse_value(value, constants::PEX_MIN_MESSAGE_INTERVAL_SECONDS)?;
            }

            constants::PEX_MAX_MESSAGE_INTERVAL_SECONDS => {
                self.pex_max_message_interval_seconds =
                    self.parse_value(value, constants::PEX_MAX_MESSAGE_INTERVAL_SECONDS)?;
            }

            constants::PEX_MIN_EVENTS_PER_MESSAGE => {
                self.pex_min_events_per_message =
                    self.parse_value(value, constants::PEX_MIN_EVENTS_PER_MESSAGE)?;
            }

            constants::PEX_MAX_EVENTS_PER_MESSAGE => {
                self.pex_max_events_per_message =
                    self.parse_value(value, constants::PEX_MAX_EVENTS_PER_MESSAGE)?;
            }

            constants::MAX_PEERS_PER_TORRENT => {
                self.max_peers_per_torrent =
                    self.parse_value(value, constants::MAX_PEERS_PER_TORRENT)?;
            }

            constants::READ_WRITE_SECONDS_TIMEOUT => {
                self.read_write_seconds_timeout =
                    self.parse_value(value, constants::READ_WRITE_SECONDS_TIMEOUT)?;
            }

            constants::ENDGAME_THRESHOLD => {
                self.endgame_threshold = self.parse_value(value, constants::ENDGAME_THRESHOLD)?;
            }

            constants::ASSIGNMENT_DEADLINE_SECONDS => {
                self.assignment_deadline_seconds =
                    self.parse_value(value, constants::ASSIGNMENT_DEADLINE_SECONDS)?;
            }

            constants::MAX_PIECES_PER_PEER => {
                self.max_pieces_per_peer =
                    self.parse_value(value, constants::MAX_PIECES_PER_PEER)?;
            }

            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("Invalid config setting name: {}", name),
                ))
            }
        }
        Ok(self)
    }

    fn parse_value<F>(&self, value: &str, setting: &str) -> io::Result<F>
    where
        F: FromStr,
    {
        match value.parse::<F>() {
            Err(_) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "Invalid setting: {}, is not a valid type: {}",
                    setting, value
                ),
            )),
            Ok(parsed) => Ok(parsed),
        }
    }

    fn validate(&self) -> io::Result<()> {
        if self.pex_min_message_interval_seconds > self.pex_max_message_interval_seconds {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "PEX min message interval ({}) above max ({})",
                    self.pex_min_message_interval_seconds, self.pex_max_message_interval_seconds
                ),
            ));
        }
        if self.block_size == 0 || self.block_size > 16384 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("Block size out of range: {}", self.block_size),
            ));
        }
        if self.choke_interval_seconds == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "Choke interval must be nonzero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};

    const FULL_CONFIG: &[u8] = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nENCRYPTION_POLICY=PREFER_PLAINTEXT\nBLOCK_SIZE=16384\nMAX_PENDING_REQUESTS_PER_PEER=10\nCHOKE_INTERVAL_SECONDS=10\nOPTIMISTIC_UNCHOKE_EVERY=3\nPEX_MIN_MESSAGE_INTERVAL_SECONDS=60\nPEX_MAX_MESSAGE_INTERVAL_SECONDS=120\nPEX_MIN_EVENTS_PER_MESSAGE=1\nPEX_MAX_EVENTS_PER_MESSAGE=50\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120\nENDGAME_THRESHOLD=5\nASSIGNMENT_DEADLINE_SECONDS=60\nMAX_PIECES_PER_PEER=3";

    #[test]
    fn test_good_config() {
        let path = "./test_good_config.cfg";
        create_and_write_file(path, FULL_CONFIG);

        let config = Cfg::new(path).unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(config.tcp_port, 6881);
        assert_eq!(config.download_directory, "./download");
        assert_eq!(config.encryption_policy, EncryptionPolicy::PreferPlaintext);
        assert_eq!(config.block_size, 16384);
        assert_eq!(config.max_pending_requests_per_peer, 10);
        assert_eq!(config.choke_interval_seconds, 10);
        assert_eq!(config.optimistic_unchoke_every, 3);
        assert_eq!(config.pex_min_message_interval_seconds, 60);
        assert_eq!(config.pex_max_message_interval_seconds, 120);
        assert_eq!(config.pex_min_events_per_message, 1);
        assert_eq!(config.pex_max_events_per_message, 50);
        assert_eq!(config.max_peers_per_torrent, 50);
        assert_eq!(config.read_write_seconds_timeout, 120);
        assert_eq!(config.endgame_threshold, 5);
        assert_eq!(config.assignment_deadline_seconds, 60);
        assert_eq!(config.max_pieces_per_peer, 3);
    }

    #[test]
    fn test_defaults_apply_when_tuning_keys_are_absent() {
        let path = "./test_defaults_apply.cfg";
        let contents = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120";
        create_and_write_file(path, contents);

        let config = Cfg::new(path).unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(config.block_size, constants::DEFAULT_BLOCK_SIZE);
        assert_eq!(
            config.pex_max_events_per_message,
            constants::DEFAULT_PEX_MAX_EVENTS_PER_MESSAGE
        );
        assert_eq!(config.encryption_policy, EncryptionPolicy::PreferPlaintext);
    }

    #[test]
    fn test_bad_path() {
        assert!(Cfg::new("bad path").is_err());
    }

    #[test]
    fn test_empty_file() {
        let path = "./test_empty_config.cfg";
        create_and_write_file(path, b"");

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_setting_doesnt_exist() {
        let path = "./test_unknown_setting.cfg";
        create_and_write_file(path, b"WRONG_SETTING=1000");

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_tcp_port_not_a_number() {
        let path = "./test_port_not_a_number.cfg";
        let contents = b"TCP_PORT=abcd\nDOWNLOAD_DIRECTORY=./download\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_unknown_encryption_policy() {
        let path = "./test_unknown_policy.cfg";
        let contents = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nENCRYPTION_POLICY=MAYBE\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_pex_min_interval_above_max_is_rejected() {
        let path = "./test_pex_interval_order.cfg";
        let contents = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nPEX_MIN_MESSAGE_INTERVAL_SECONDS=180\nPEX_MAX_MESSAGE_INTERVAL_SECONDS=120\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_oversized_block_size_is_rejected() {
        let path = "./test_block_size.cfg";
        let contents = b"TCP_PORT=6881\nDOWNLOAD_DIRECTORY=./download\nBLOCK_SIZE=32768\nMAX_PEERS_PER_TORRENT=50\nREAD_WRITE_SECONDS_TIMEOUT=120";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_bad_format() {
        let path = "./test_bad_format.cfg";
        let contents = b"TCP_PORT=abcd=1234\nDOWNLOAD_DIRECTORY=./download";
        create_and_write_file(path, contents);

        create_and_assert_config_is_not_ok(path);
    }

    #[test]
    fn test_order_doesnt_matter() {
        let path = "./test_order_doesnt_matter.cfg";
        let contents = b"READ_WRITE_SECONDS_TIMEOUT=10\nMAX_PEERS_PER_TORRENT=1\nDOWNLOAD_DIRECTORY=./d2\nTCP_PORT=2500";
        create_and_write_file(path, contents);

        let config = Cfg::new(path).unwrap();
        fs::remove_file(path).unwrap();

        assert_eq!(config.tcp_port, 2500);
        assert_eq!(config.download_directory, "./d2");
        assert_eq!(config.max_peers_per_torrent, 1);
        assert_eq!(config.read_write_seconds_timeout, 10);
    }

    #[test]
    fn test_handshake_flag_last_wins() {
        assert_eq!(EncryptionPolicy::RequirePlaintext.handshake_flag(), 0);
        assert_eq!(EncryptionPolicy::PreferPlaintext.handshake_flag(), 0);
        assert_eq!(EncryptionPolicy::PreferEncrypted.handshake_flag(), 1);
        assert_eq!(EncryptionPolicy::RequireEncrypted.handshake_flag(), 1);
    }

    // Auxiliary functions

    fn create_and_write_file(path: &str, contents: &[u8]) {
        let mut file = File::create(path).unwrap_or_else(|_| panic!("Error creating {}", path));
        file.write_all(contents)
            .unwrap_or_else(|_| panic!("Error writing {}", path));
    }

    fn create_and_assert_config_is_not_ok(path: &str) {
        let config = Cfg::new(path);
        assert!(config.is_err());
        fs::remove_file(path).unwrap_or_else(|_| panic!("Error removing {}", path));
    }
}

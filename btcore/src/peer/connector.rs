use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::peer::peer::Peer;
use crate::peer::session::{PeerSession, PeerSessionError, SessionContext};

/// First retry delay; doubles per attempt.
const BASE_DELAY: Duration = Duration::from_secs(2);

/// Ceiling for the doubling delay.
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Attempts before the peer is dropped from the active set (it may
/// come back through discovery).
const MAX_ATTEMPTS: u32 = 5;

/// Dials candidate peers, retrying transient connect failures with
/// exponential backoff.
#[derive(Debug, Clone)]
pub struct PeerConnector {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for PeerConnector {
    fn default() -> Self {
        Self {
            base_delay: BASE_DELAY,
            max_delay: MAX_DELAY,
            max_attempts: MAX_ATTEMPTS,
        }
    }
}

impl PeerConnector {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Runs an outgoing session, reconnecting on transient failures
    /// until the attempt cap or a torrent stop.
    ///
    /// Protocol errors and the like are not retried; the session
    /// already decided the peer is not worth another dial.
    pub fn connect(&self, peer: Peer, context: Arc<SessionContext>) -> Result<(), PeerSessionError> {
        let mut delay = self.base_delay;
        let mut attempt = 0;

        loop {
            let mut session = PeerSession::new(peer, context.clone());
            match session.start_outgoing() {
                Ok(()) => return Ok(()),
                Err(err) if Self::is_transient(&err) => {
                    attempt += 1;
                    if attempt >= self.max_attempts || context.is_stopped() {
                        debug!("Dropping {} after {} attempts", peer, attempt);
                        return Err(err);
                    }
                    debug!("Retrying {} in {:?}: {:?}", peer, delay, err);
                    thread::sleep(delay);
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn is_transient(err: &PeerSessionError) -> bool {
        matches!(
            err,
            PeerSessionError::CouldNotConnectToPeer
                | PeerSessionError::ErrorReadingHandshake(_)
                | PeerSessionError::ErrorReadingMessage(_)
                | PeerSessionError::ErrorSendingMessage(_)
        )
    }

    /// Dials the peer on its own named thread.
    pub fn spawn(
        &self,
        peer: Peer,
        context: Arc<SessionContext>,
    ) -> io::Result<thread::JoinHandle<()>> {
        let connector = self.clone();
        let name = format!("Torrent: {} / Peer: {}", context.torrent.name(), peer);
        thread::Builder::new().name(name).spawn(move || {
            if let Err(err) = connector.connect(peer, context) {
                warn!("{:?}", err);
            }
        })
    }
}

pub mod acceptor;
pub mod connection;
pub mod connector;
pub mod extended;
pub mod handshake;
pub mod message;
pub mod peer;
pub mod pool;
pub mod session;

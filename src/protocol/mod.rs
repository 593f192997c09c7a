pub mod channel;
pub mod error;
pub mod mock;
pub mod remote;
pub mod transport;
pub mod tty;

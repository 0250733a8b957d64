pub mod checksum;
pub mod frame;
pub mod config;
pub mod transport;
pub mod link_state;
pub mod dispatch;
pub mod connection;
pub mod consumer;
pub mod xfer;
pub mod relay;
pub mod digest;
pub mod sim;

pub mod time;
pub mod packet_io;
pub mod messages;
pub mod handshake;
pub mod flows;
pub mod sessions;
pub mod flash;
pub mod group;
pub mod publisher;
pub mod engine;

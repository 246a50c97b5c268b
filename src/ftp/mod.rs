pub mod channel;
pub mod datachannel;
pub mod listing;
pub mod messages;
pub mod passive;
pub mod server;

pub use channel::FtpChannel;
pub use datachannel::{ApplicationXmitStream, RecvChannel, XmitChannel};
pub use messages::StatusMessage;
pub use passive::PassiveAcceptor;
pub use server::FtpServer;

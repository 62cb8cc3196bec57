mod channel;
mod error;
mod reactor;
mod socket;
mod timer;

pub use channel::{Callbacks, ChannelStatus, MonitorCallback, ReadCallback, Source, StatusCallback};
pub use error::ReactorError;
pub use reactor::{global, EventLoop};
pub use socket::{BorrowedSocket, Socket, TcpSocket};
pub use timer::{TimerCallback, TimerId};

pub mod notification;
pub mod observer;
pub mod protocol;
pub mod socket_address;

pub use notification::{ChannelPhase, ConfirmationReport, ControlChannel};
pub use observer::{ObserverConnection, ObserverEvent, ObserverHandler};
pub use protocol::{BufferRequest, CommandId, NotifyMessage};
pub use socket_address::{SocketAddress, NOTIFY_PORT};

// GB28181 SIP 信令
// 报文编解码、鉴权、设备注册表、媒体会话与传输分发

pub mod auth;
pub mod catalog;
pub mod config;
pub mod heartbeat;
pub mod media;
pub mod message;
pub mod ptz;
pub mod record;
pub mod registry;
pub mod sdp;
pub mod server;
pub mod session;

pub use auth::DigestAuthenticator;
pub use config::{RtpPortRange, SipServerConfig};
pub use media::{PortRangeAllocator, RtpPortAllocator};
pub use message::{ParseError, SipMessage, SipMethod, SipRequest, SipResponse};
pub use record::{RecordCache, RecordList, TimeRange};
pub use registry::{
    Channel, Device, DeviceRegistry, DeviceStatus, RegistryObserver, RegistryStats, Transport,
};
pub use server::SipServer;
pub use session::{MediaSession, SessionKind, SessionManager, SessionState};

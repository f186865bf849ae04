// vigil-gb28181: GB28181 信令与媒体会话引擎
//
// 组成：
// - SIP 报文编解码、Digest 鉴权
// - 设备/通道注册表（心跳驱动的生命周期）
// - INVITE/ACK/BYE 实时点播与录像回放状态机，RecordInfo 录像检索
// - UDP/TCP 传输分发与心跳清理

pub mod error;

// GB28181 SIP 信令层
pub mod sip;

// 重新导出常用类型
pub use error::{Gb28181Error, Result};

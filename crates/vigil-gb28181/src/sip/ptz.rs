// GB28181 云台控制
// PTZCmd 字节码：A5 0F 01 <指令> <水平速度> <垂直速度> <变倍速度(高4位)> <校验>

/// 云台指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtzCommand {
    Up,
    Down,
    Left,
    Right,
    LeftUp,
    LeftDown,
    RightUp,
    RightDown,
    ZoomIn,
    ZoomOut,
    Stop,
}

impl PtzCommand {
    /// 指令字
    pub fn code(&self) -> u8 {
        match self {
            PtzCommand::Up => 0x08,
            PtzCommand::Down => 0x04,
            PtzCommand::Left => 0x02,
            PtzCommand::Right => 0x01,
            PtzCommand::LeftUp => 0x0A,
            PtzCommand::LeftDown => 0x06,
            PtzCommand::RightUp => 0x09,
            PtzCommand::RightDown => 0x05,
            PtzCommand::ZoomIn => 0x10,
            PtzCommand::ZoomOut => 0x20,
            PtzCommand::Stop => 0x00,
        }
    }
}

/// 不区分大小写；无法识别的指令按停止处理
impl From<&str> for PtzCommand {
    fn from(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => PtzCommand::Up,
            "down" => PtzCommand::Down,
            "left" => PtzCommand::Left,
            "right" => PtzCommand::Right,
            "leftup" | "upleft" => PtzCommand::LeftUp,
            "leftdown" | "downleft" => PtzCommand::LeftDown,
            "rightup" | "upright" => PtzCommand::RightUp,
            "rightdown" | "downright" => PtzCommand::RightDown,
            "zoomin" | "zoom_in" => PtzCommand::ZoomIn,
            "zoomout" | "zoom_out" => PtzCommand::ZoomOut,
            _ => PtzCommand::Stop,
        }
    }
}

/// 速度归一化：<=0 取 128，>255 取 255
pub fn normalize_speed(speed: i32) -> u8 {
    if speed <= 0 {
        128
    } else {
        speed.min(255) as u8
    }
}

/// 生成 8 字节 PTZCmd 的大写十六进制串
pub fn encode_ptz_command(command: PtzCommand, speed: i32) -> String {
    let speed = normalize_speed(speed);

    let (pan, tilt, zoom) = match command {
        PtzCommand::Up | PtzCommand::Down => (0, speed, 0),
        PtzCommand::Left | PtzCommand::Right => (speed, 0, 0),
        PtzCommand::LeftUp | PtzCommand::LeftDown | PtzCommand::RightUp | PtzCommand::RightDown => {
            (speed, speed, 0)
        }
        // 变倍速度 0-15，占第 7 字节高 4 位
        PtzCommand::ZoomIn | PtzCommand::ZoomOut => (0, 0, (speed >> 4) << 4),
        PtzCommand::Stop => (0, 0, 0),
    };

    let mut bytes = [0xA5, 0x0F, 0x01, command.code(), pan, tilt, zoom, 0];
    bytes[7] = bytes[..7].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));

    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// DeviceControl 控制消息体
pub fn control_xml(sn: u32, device_id: &str, ptz_cmd: &str, speed: u8, channel_id: &str) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
         <Control>\r\n\
         <CmdType>DeviceControl</CmdType>\r\n\
         <SN>{}</SN>\r\n\
         <DeviceID>{}</DeviceID>\r\n\
         <PTZCmd>{}</PTZCmd>\r\n\
         <Speed>{}</Speed>\r\n\
         <Channel>{}</Channel>\r\n\
         </Control>\r\n",
        sn, device_id, ptz_cmd, speed, channel_id
    )
}

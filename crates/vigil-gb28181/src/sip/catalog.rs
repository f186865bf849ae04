// GB28181 MANSCDP 消息体
// 解析设备上报的 Keepalive/Catalog/DeviceInfo/RecordInfo XML，生成平台下发的查询 XML

use super::record::{format_device_time, TimeRange};
use super::registry::{Channel, DeviceInfoUpdate};
use crate::{Gb28181Error, Result};
use quick_xml::de::from_str;
use serde::{Deserialize, Serialize};

/// MANSCDP 消息体的 Content-Type
pub const MANSCDP_CONTENT_TYPE: &str = "Application/MANSCDP+xml";

/// MANSCDP 消息（Notify/Response/Query 共用字段）
#[derive(Debug, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ManscdpMessage {
    pub cmd_type: String,

    #[serde(rename = "SN", default)]
    pub sn: Option<u32>,

    #[serde(rename = "DeviceID", default)]
    pub device_id: String,

    /// 目录总数（分页应答时每页都携带）
    #[serde(default)]
    pub sum_num: Option<u32>,

    #[serde(default)]
    pub device_list: Option<DeviceList>,

    /// RecordInfo 应答的录像列表
    #[serde(default)]
    pub record_list: Option<RecordItems>,

    /// 以下为 DeviceInfo 应答字段
    #[serde(default)]
    pub device_name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub firmware: String,

    #[serde(default)]
    pub result: String,

    /// Keepalive 中的 OK
    #[serde(default)]
    pub status: String,
}

impl ManscdpMessage {
    pub fn items(&self) -> &[CatalogItem] {
        self.device_list
            .as_ref()
            .map(|list| list.items.as_slice())
            .unwrap_or_default()
    }

    pub fn records(&self) -> &[RecordItem] {
        self.record_list
            .as_ref()
            .map(|list| list.items.as_slice())
            .unwrap_or_default()
    }

    pub fn device_info(&self) -> DeviceInfoUpdate {
        DeviceInfoUpdate {
            name: self.device_name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            firmware: self.firmware.clone(),
        }
    }
}

/// 目录列表
#[derive(Debug, Deserialize, PartialEq)]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<CatalogItem>,
}

/// 目录项（通道，或设备自身）
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItem {
    #[serde(rename = "DeviceID")]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub manufacturer: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub civil_code: String,

    #[serde(default)]
    pub address: String,

    #[serde(rename = "ParentID", default)]
    pub parent_id: String,

    /// ON/OFF
    #[serde(default)]
    pub status: String,

    #[serde(default)]
    pub longitude: String,

    #[serde(default)]
    pub latitude: String,

    /// 部分厂商直接放在 Item 下
    #[serde(rename = "PTZType", default)]
    pub ptz_type: String,

    /// 部分厂商（如大华）放在 Info 下
    #[serde(default)]
    pub info: Option<CatalogItemInfo>,
}

/// 目录项扩展信息
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct CatalogItemInfo {
    #[serde(rename = "PTZType", default)]
    pub ptz_type: String,

    #[serde(default)]
    pub download_speed: String,
}

impl CatalogItem {
    /// 云台类型：优先 Item 下的值，为 0 或缺失时取 Info 下的值
    pub fn ptz_type(&self) -> u8 {
        let direct = parse_ptz_type(&self.ptz_type);
        if direct > 0 {
            return direct;
        }
        self.info
            .as_ref()
            .map(|info| parse_ptz_type(&info.ptz_type))
            .unwrap_or(0)
    }

    pub fn to_channel(&self) -> Channel {
        let mut channel = Channel::new(self.device_id.clone(), self.name.clone());
        channel.manufacturer = self.manufacturer.clone();
        channel.model = self.model.clone();
        channel.parent_id = self.parent_id.clone();
        channel.address = self.address.clone();
        channel.status = self.status.clone();
        channel.ptz_type = self.ptz_type();
        channel.longitude = self.longitude.clone();
        channel.latitude = self.latitude.clone();
        channel
    }

    pub fn device_info(&self) -> DeviceInfoUpdate {
        DeviceInfoUpdate {
            name: self.name.clone(),
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            firmware: String::new(),
        }
    }
}

/// 录像列表
#[derive(Debug, Deserialize, PartialEq)]
pub struct RecordItems {
    #[serde(rename = "@Num", default)]
    pub num: Option<u32>,

    #[serde(rename = "Item", default)]
    pub items: Vec<RecordItem>,
}

/// 录像文件条目；XML 中为 PascalCase，API 输出为 snake_case
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all(deserialize = "PascalCase"))]
pub struct RecordItem {
    #[serde(rename(deserialize = "DeviceID"), default)]
    pub device_id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub file_path: String,

    #[serde(default)]
    pub address: String,

    #[serde(default)]
    pub start_time: String,

    #[serde(default)]
    pub end_time: String,

    #[serde(default)]
    pub secrecy: String,

    /// time/alarm/manual
    #[serde(rename(deserialize = "Type"), default)]
    pub record_type: String,

    #[serde(rename(deserialize = "RecorderID"), default)]
    pub recorder_id: String,

    #[serde(default)]
    pub file_size: String,
}

fn parse_ptz_type(value: &str) -> u8 {
    value.trim().parse().unwrap_or(0)
}

/// 解析 MANSCDP XML
pub fn parse_manscdp(xml: &str) -> Result<ManscdpMessage> {
    from_str(xml.trim())
        .map_err(|e| Gb28181Error::Xml(format!("Failed to parse MANSCDP body: {}", e)))
}

/// 根元素名称（Notify/Response/Query/Control），跳过 XML 声明和注释
pub fn root_element(xml: &str) -> Option<&str> {
    let mut rest = xml;
    loop {
        let start = rest.find('<')?;
        rest = &rest[start + 1..];
        if rest.starts_with('?') || rest.starts_with('!') {
            continue;
        }
        let end = rest.find(|c: char| c == '>' || c == '/' || c.is_whitespace())?;
        let name = &rest[..end];
        return (!name.is_empty()).then_some(name);
    }
}

/// 平台下发的查询类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryCmd {
    Catalog,
    DeviceInfo,
}

impl QueryCmd {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryCmd::Catalog => "Catalog",
            QueryCmd::DeviceInfo => "DeviceInfo",
        }
    }
}

/// 查询请求（发送给设备）
#[derive(Debug)]
pub struct Query {
    pub cmd: QueryCmd,
    pub sn: u32,
    pub device_id: String,
}

impl Query {
    pub fn new(cmd: QueryCmd, sn: u32, device_id: impl Into<String>) -> Self {
        Self {
            cmd,
            sn,
            device_id: device_id.into(),
        }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
             <Query>\r\n\
             <CmdType>{}</CmdType>\r\n\
             <SN>{}</SN>\r\n\
             <DeviceID>{}</DeviceID>\r\n\
             </Query>\r\n",
            self.cmd.as_str(),
            self.sn,
            self.device_id
        )
    }
}

/// 录像类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RecordType {
    #[default]
    All,
    Time,
    Alarm,
    Manual,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::All => "all",
            RecordType::Time => "time",
            RecordType::Alarm => "alarm",
            RecordType::Manual => "manual",
        }
    }
}

/// 未识别的类型按 all 处理
impl From<&str> for RecordType {
    fn from(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "time" => RecordType::Time,
            "alarm" => RecordType::Alarm,
            "manual" => RecordType::Manual,
            _ => RecordType::All,
        }
    }
}

/// 录像检索请求
#[derive(Debug)]
pub struct RecordInfoQuery {
    pub sn: u32,

    /// 通道 ID
    pub device_id: String,

    pub range: TimeRange,
    pub record_type: RecordType,
}

impl RecordInfoQuery {
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"GB2312\"?>\r\n\
             <Query>\r\n\
             <CmdType>RecordInfo</CmdType>\r\n\
             <SN>{}</SN>\r\n\
             <DeviceID>{}</DeviceID>\r\n\
             <StartTime>{}</StartTime>\r\n\
             <EndTime>{}</EndTime>\r\n\
             <Secrecy>0</Secrecy>\r\n\
             <Type>{}</Type>\r\n\
             </Query>\r\n",
            self.sn,
            self.device_id,
            format_device_time(&self.range.start),
            format_device_time(&self.range.end),
            self.record_type.as_str()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>Catalog</CmdType>
<SN>123</SN>
<DeviceID>34020000001320000001</DeviceID>
<SumNum>3</SumNum>
<DeviceList Num="3">
<Item>
<DeviceID>34020000001320000001</DeviceID>
<Name>NVR</Name>
<Manufacturer>Hikvision</Manufacturer>
<Model>DS-7808N</Model>
<Status>ON</Status>
</Item>
<Item>
<DeviceID>34020000001310000001</DeviceID>
<Name>摄像头1</Name>
<Manufacturer>海康威视</Manufacturer>
<ParentID>34020000001320000001</ParentID>
<Status>ON</Status>
<Longitude>120.1</Longitude>
<Latitude>30.2</Latitude>
<PTZType>1</PTZType>
</Item>
<Item>
<DeviceID>34020000001310000002</DeviceID>
<Name>摄像头2</Name>
<Manufacturer>大华</Manufacturer>
<Status>OFF</Status>
<Info>
<PTZType>4</PTZType>
<DownloadSpeed>1/2/4</DownloadSpeed>
</Info>
</Item>
</DeviceList>
</Response>"#;

    #[test]
    fn test_parse_catalog_response() {
        let msg = parse_manscdp(CATALOG).unwrap();
        assert_eq!(msg.cmd_type, "Catalog");
        assert_eq!(msg.sn, Some(123));
        assert_eq!(msg.sum_num, Some(3));
        assert_eq!(msg.device_list.as_ref().unwrap().num, Some(3));

        let items = msg.items();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].ptz_type(), 0);
        assert_eq!(items[1].ptz_type(), 1);
        // 嵌套在 Info 下的 PTZType
        assert_eq!(items[2].ptz_type(), 4);

        let channel = items[1].to_channel();
        assert_eq!(channel.channel_id, "34020000001310000001");
        assert_eq!(channel.name, "摄像头1");
        assert_eq!(channel.parent_id, "34020000001320000001");
        assert_eq!(channel.longitude, "120.1");
        assert!(channel.is_online());
        assert!(!items[2].to_channel().is_online());
    }

    #[test]
    fn test_parse_device_info_response() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>DeviceInfo</CmdType>
<SN>7</SN>
<DeviceID>34020000001320000001</DeviceID>
<DeviceName>Gate NVR</DeviceName>
<Result>OK</Result>
<Manufacturer>Hikvision</Manufacturer>
<Model>DS-7808N</Model>
<Firmware>V4.1.0</Firmware>
<Channel>8</Channel>
</Response>"#;

        let msg = parse_manscdp(xml).unwrap();
        assert_eq!(msg.cmd_type, "DeviceInfo");
        let info = msg.device_info();
        assert_eq!(info.name, "Gate NVR");
        assert_eq!(info.firmware, "V4.1.0");
        assert!(msg.items().is_empty());
    }

    #[test]
    fn test_parse_keepalive() {
        let xml = r#"<?xml version="1.0"?>
<Notify>
<CmdType>Keepalive</CmdType>
<SN>44</SN>
<DeviceID>34020000001320000001</DeviceID>
<Status>OK</Status>
</Notify>"#;

        let msg = parse_manscdp(xml).unwrap();
        assert_eq!(msg.cmd_type, "Keepalive");
        assert_eq!(msg.status, "OK");
        assert_eq!(root_element(xml), Some("Notify"));
    }

    #[test]
    fn test_parse_record_info_response() {
        let xml = r#"<?xml version="1.0" encoding="GB2312"?>
<Response>
<CmdType>RecordInfo</CmdType>
<SN>17</SN>
<DeviceID>34020000001310000001</DeviceID>
<Name>Camera 1</Name>
<SumNum>2</SumNum>
<RecordList Num="2">
<Item>
<DeviceID>34020000001310000001</DeviceID>
<Name>Camera 1</Name>
<FilePath>/record/0001.mp4</FilePath>
<Address>Gate</Address>
<StartTime>2025-12-23T00:00:00</StartTime>
<EndTime>2025-12-23T00:30:00</EndTime>
<Secrecy>0</Secrecy>
<Type>time</Type>
<FileSize>104857600</FileSize>
</Item>
<Item>
<DeviceID>34020000001310000001</DeviceID>
<StartTime>2025-12-23T00:30:00</StartTime>
<EndTime>2025-12-23T01:00:00</EndTime>
<Type>alarm</Type>
</Item>
</RecordList>
</Response>"#;

        let msg = parse_manscdp(xml).unwrap();
        assert_eq!(msg.cmd_type, "RecordInfo");
        assert_eq!(msg.sum_num, Some(2));
        let records = msg.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].file_path, "/record/0001.mp4");
        assert_eq!(records[0].record_type, "time");
        assert_eq!(records[0].file_size, "104857600");
        assert_eq!(records[1].record_type, "alarm");
        assert!(records[1].file_path.is_empty());

        let json = serde_json::to_value(&records[0]).unwrap();
        assert_eq!(json["start_time"], "2025-12-23T00:00:00");
        assert_eq!(json["record_type"], "time");
    }

    #[test]
    fn test_record_info_query_xml() {
        let range = TimeRange::parse("2025-12-23 00:00:00", "2025-12-23T23:59:59").unwrap();
        let query = RecordInfoQuery {
            sn: 9,
            device_id: "34020000001310000001".to_string(),
            range,
            record_type: RecordType::from("ALARM"),
        };
        let xml = query.to_xml();
        assert!(xml.contains("<CmdType>RecordInfo</CmdType>"));
        assert!(xml.contains("<StartTime>2025-12-23T00:00:00</StartTime>"));
        assert!(xml.contains("<EndTime>2025-12-23T23:59:59</EndTime>"));
        assert!(xml.contains("<Type>alarm</Type>"));
        assert_eq!(RecordType::from("bogus"), RecordType::All);
        assert_eq!(root_element(&xml), Some("Query"));
    }

    #[test]
    fn test_parse_garbage_is_error() {
        assert!(matches!(parse_manscdp("not xml"), Err(Gb28181Error::Xml(_))));
    }

    #[test]
    fn test_root_element() {
        assert_eq!(root_element(CATALOG), Some("Response"));
        assert_eq!(root_element("<!-- x --><Query/>"), Some("Query"));
        assert_eq!(root_element("plain"), None);
    }

    #[test]
    fn test_query_xml() {
        let xml = Query::new(QueryCmd::DeviceInfo, 456, "34020000001320000001").to_xml();
        assert!(xml.starts_with("<?xml version=\"1.0\" encoding=\"GB2312\"?>"));
        assert!(xml.contains("<CmdType>DeviceInfo</CmdType>"));
        assert!(xml.contains("<SN>456</SN>"));
        assert!(xml.contains("<DeviceID>34020000001320000001</DeviceID>"));

        let parsed = parse_manscdp(&Query::new(QueryCmd::Catalog, 1, "x").to_xml()).unwrap();
        assert_eq!(parsed.cmd_type, "Catalog");
    }
}

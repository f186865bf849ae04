// 设备录像检索与回放时间段
// RecordInfo 应答按通道缓存，分页应答逐页合并

use super::catalog::RecordItem;
use crate::{Gb28181Error, Result};
use chrono::{DateTime, Local, LocalResult, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// 设备侧时间格式（MANSCDP 使用 `T` 分隔，部分平台使用空格）
const DEVICE_TIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];

pub fn parse_device_time(value: &str) -> Result<NaiveDateTime> {
    let value = value.trim();
    DEVICE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .ok_or_else(|| Gb28181Error::InvalidArgument(format!("invalid time {:?}", value)))
}

pub fn format_device_time(time: &NaiveDateTime) -> String {
    time.format(DEVICE_TIME_FORMATS[0]).to_string()
}

/// 设备本地时间对应的 Unix 秒；本地时区无此时刻时按 UTC 处理
fn local_timestamp(time: &NaiveDateTime) -> i64 {
    match Local.from_local_datetime(time) {
        LocalResult::Single(t) | LocalResult::Ambiguous(t, _) => t.timestamp(),
        LocalResult::None => Utc.from_utc_datetime(time).timestamp(),
    }
}

/// 录像检索/回放的时间段（设备本地时间）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl TimeRange {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Result<Self> {
        if end <= start {
            return Err(Gb28181Error::InvalidArgument(format!(
                "end time {} is not after start time {}",
                format_device_time(&end),
                format_device_time(&start)
            )));
        }
        Ok(Self { start, end })
    }

    pub fn parse(start: &str, end: &str) -> Result<Self> {
        Self::new(parse_device_time(start)?, parse_device_time(end)?)
    }

    /// SDP `t=` 行的起止时间
    pub fn sdp_timing(&self) -> (i64, i64) {
        (local_timestamp(&self.start), local_timestamp(&self.end))
    }
}

/// 单个通道的录像检索结果
#[derive(Debug, Clone, Serialize)]
pub struct RecordList {
    pub device_id: String,
    pub channel_id: String,

    /// 设备声明的总条数
    pub sum_num: u32,

    pub records: Vec<RecordItem>,
    pub updated_at: DateTime<Utc>,
}

impl RecordList {
    fn empty(device_id: &str, channel_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            channel_id: channel_id.to_string(),
            sum_num: 0,
            records: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// 所有分页是否已到齐
    pub fn is_complete(&self) -> bool {
        self.records.len() >= self.sum_num as usize
    }
}

/// 录像检索结果缓存（键为通道 ID）
#[derive(Debug, Default)]
pub struct RecordCache {
    lists: RwLock<HashMap<String, RecordList>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发起新检索：丢弃该通道的旧结果
    pub async fn begin(&self, device_id: &str, channel_id: &str) {
        self.lists
            .write()
            .await
            .insert(channel_id.to_string(), RecordList::empty(device_id, channel_id));
    }

    /// 合并一页应答，返回合并后的总条数
    ///
    /// 只接受本平台向该设备发起过检索的通道；重复条目（起止时间与文件路径相同）只保留一条。
    pub async fn merge(
        &self,
        device_id: &str,
        channel_id: &str,
        sum_num: u32,
        items: &[RecordItem],
    ) -> Option<usize> {
        let mut lists = self.lists.write().await;
        let list = lists.get_mut(channel_id)?;
        if list.device_id != device_id {
            return None;
        }

        list.sum_num = list.sum_num.max(sum_num);
        for item in items {
            let duplicate = list.records.iter().any(|r| {
                r.start_time == item.start_time
                    && r.end_time == item.end_time
                    && r.file_path == item.file_path
            });
            if !duplicate {
                list.records.push(item.clone());
            }
        }
        list.records.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        list.updated_at = Utc::now();
        Some(list.records.len())
    }

    pub async fn get(&self, channel_id: &str) -> Option<RecordList> {
        self.lists.read().await.get(channel_id).cloned()
    }

    pub async fn clear(&self, channel_id: &str) -> bool {
        self.lists.write().await.remove(channel_id).is_some()
    }
}

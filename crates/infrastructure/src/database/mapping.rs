//! 行映射辅助函数
//!
//! 时间统一存为毫秒时间戳，列表/映射字段存为JSON文本。

use chrono::{DateTime, Utc};
use dispatch_core::{DispatchError, DispatchResult};
use serde::{de::DeserializeOwned, Serialize};

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn to_millis(time: DateTime<Utc>) -> i64 {
        time.timestamp_millis()
    }

    pub fn opt_to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
        time.map(Self::to_millis)
    }

    pub fn from_millis(millis: i64) -> DispatchResult<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| DispatchError::Serialization(format!("无效的时间戳: {millis}")))
    }

    pub fn opt_from_millis(millis: Option<i64>) -> DispatchResult<Option<DateTime<Utc>>> {
        millis.map(Self::from_millis).transpose()
    }

    pub fn to_json<T: Serialize>(value: &T) -> DispatchResult<String> {
        serde_json::to_string(value)
            .map_err(|e| DispatchError::Serialization(format!("序列化字段失败: {e}")))
    }

    /// 唯一约束冲突转为 `DuplicateKey`，其余保持数据库错误
    pub fn map_unique_violation(err: sqlx::Error, key: &str) -> DispatchError {
        match &err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                DispatchError::DuplicateKey(key.to_string())
            }
            _ => DispatchError::Database(err),
        }
    }

    pub fn from_json<T: DeserializeOwned>(text: &str, field: &str) -> DispatchResult<T> {
        serde_json::from_str(text)
            .map_err(|e| DispatchError::Serialization(format!("解析字段{field}失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_keeps_millisecond_precision() {
        let now = Utc::now();
        let restored = MappingHelpers::from_millis(MappingHelpers::to_millis(now)).unwrap();
        assert_eq!(restored.timestamp_millis(), now.timestamp_millis());
        assert_eq!(MappingHelpers::opt_from_millis(None).unwrap(), None);
    }

    #[test]
    fn test_from_json_reports_field() {
        let err = MappingHelpers::from_json::<Vec<String>>("not json", "already_tried").unwrap_err();
        assert!(err.to_string().contains("already_tried"));
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

/// 乐观消息临时 ID 前缀
pub const TEMP_ID_PREFIX: &str = "temp-";

/// 反序列化数组字段，处理 null 值（`deleted_for` 在旧数据里可能是 null）
pub fn deserialize_vec_or_null<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    let opt = Option::<Vec<T>>::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// 生成乐观消息的临时 ID：`temp-<纳秒时间戳>`
pub fn generate_temp_id() -> String {
    let now = Utc::now();
    let nanos = now
        .timestamp_nanos_opt()
        .unwrap_or_else(|| now.timestamp_micros() * 1_000);
    format!("{}{}", TEMP_ID_PREFIX, nanos)
}

/// 是否为尚未被服务端确认的临时 ID
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// 生成发送幂等键（随每条外发消息写入远端）
pub fn generate_client_key() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 没有已读标记时的默认已读时间
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

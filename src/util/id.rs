use uuid::Uuid;

/// 请求级追踪 id，用于把一次调用的日志串起来。
pub fn request_id() -> String {
    format!("req-{}", Uuid::new_v4().simple())
}

use std::time::Duration;

pub const SESSION_TTL: Duration = Duration::from_secs(10 * 60);
pub const ANALYTICS_TTL: Duration = Duration::from_secs(2 * 60);

pub fn session_key(token_hash: &str) -> String {
    format!("lms:session:{token_hash}")
}

pub fn student_summary_key(student_id: &str) -> String {
    format!("lms:analytics:student:{student_id}")
}

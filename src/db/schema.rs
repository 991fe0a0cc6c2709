use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Printer record from database
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Printer {
    pub serial: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub ip_address: Option<String>,
    pub access_code: Option<String>,
    pub last_seen: Option<i64>,
    pub config: Option<String>,
    pub auto_connect: Option<bool>,
}

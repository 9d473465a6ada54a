use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A third-party access token, keyed by (user, provider). Opaque to the
/// scheduler; the Store persists it purely because it shares the same
/// embedded database (§3).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserToken {
    pub user_id: String,
    pub provider: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

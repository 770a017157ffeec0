use jagc_core::strip_leading_zeroes;

#[derive(Debug, Clone)]
pub struct TelegramGatewayConfig {
    pub bot_token: String,
    /// Numeric user ids, leading zeroes already stripped. `*` allows anyone.
    pub allowed_user_ids: Vec<String>,
    /// Override for tests; production talks to api.telegram.org.
    pub api_base: String,
    /// Long-poll timeout handed to `getUpdates`.
    pub poll_timeout_secs: u64,
}

impl TelegramGatewayConfig {
    pub fn new(bot_token: String, allowed_user_ids: Vec<String>) -> Self {
        Self {
            bot_token,
            allowed_user_ids,
            api_base: "https://api.telegram.org".to_string(),
            poll_timeout_secs: 25,
        }
    }
}

/// Allow-list check at the user level. Leading zeroes are stripped from the
/// candidate so `007` and `7` compare equal; an empty list denies everyone.
pub fn is_user_allowed(user_id: i64, allowed: &[String]) -> bool {
    if allowed.iter().any(|a| a == "*") {
        return true;
    }
    let candidate = strip_leading_zeroes(&user_id.to_string());
    allowed.iter().any(|a| a == &candidate)
}

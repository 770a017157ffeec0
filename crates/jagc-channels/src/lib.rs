pub mod api;
pub mod bridge;
pub mod config;
pub mod follow;
pub mod gateway;

pub use api::{TelegramApi, TelegramError};
pub use bridge::{TelegramTaskRunNotifier, TelegramTopicBridge};
pub use config::{is_user_allowed, TelegramGatewayConfig};
pub use follow::{split_terminal_message, RunFollower, DELIVERY_CHUNK_LIMIT};
pub use gateway::TelegramGateway;

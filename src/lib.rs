pub mod api_keys;
pub mod app;
pub mod auth;
pub mod bot_sync;
pub mod bots;
pub mod chat;
pub mod conversations;
pub mod dashboard_handlers;
pub mod error;
pub mod handlers;
pub mod relay;
pub mod store;
pub mod upstream;
pub mod users;

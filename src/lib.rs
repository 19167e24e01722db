pub mod chat;
pub mod citations;
pub mod client;
pub mod config;
pub mod conversation;
pub mod events;
pub mod models;
pub mod ndjson;
pub mod reducer;

pub use chat::ChatService;
pub use citations::parse_answer;
pub use config::ClientConfig;
pub use reducer::StreamReducer;

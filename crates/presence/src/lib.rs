pub mod active_users;
pub mod client;
pub mod heartbeat;
pub mod resolver;

pub use active_users::ActiveUserTracker;
pub use client::{Client, CustomRedisError, MockRedisClient, RedisClient};
pub use heartbeat::HeartBeater;
pub use resolver::ServerResolver;

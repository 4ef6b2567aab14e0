pub mod health;
pub mod rate_limit;

pub use health::{HealthGate, HealthMonitor, HealthSnapshot, PortalStatus};
pub use rate_limit::{RedisTokenBucket, Throttle, TokenBucket};

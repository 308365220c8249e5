pub mod clock;
pub mod feature_gate;
pub mod feature_handler;
pub mod metrics;
pub mod quota_ledger;
pub mod redis;
pub mod replenishment;

pub use clock::*;
pub use feature_gate::*;
pub use feature_handler::*;
pub use metrics::*;
pub use quota_ledger::*;
pub use redis::RedisService;
pub use replenishment::*;

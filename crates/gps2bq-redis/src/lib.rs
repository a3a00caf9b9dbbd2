// gps2bq-redis - Redis-facing components
//
// The atomic drainer and the distributed lease lock. Both speak to the
// server through a ConnectionManager so reconnects are transparent, and
// both keep their invariants server-side in small Lua scripts.

mod drain;
mod lock;

pub use drain::RedisQueue;
pub use lock::RedisLock;

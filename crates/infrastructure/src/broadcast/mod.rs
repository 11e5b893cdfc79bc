pub mod in_memory;
pub mod redis;

pub use in_memory::InMemoryBroadcastBus;
pub use self::redis::RedisBroadcast;

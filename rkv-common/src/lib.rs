// rkv-common - Shared value model, RESP codec and errors for the RKV client
//
// This crate has no networking of its own: it converts between `RedisValue`
// and the RESP2 byte format over any `Read`/`Write` pair.

pub mod error;
pub mod protocol;
pub mod value;

// Re-export for convenience
pub use error::*;
pub use protocol::*;
pub use value::*;

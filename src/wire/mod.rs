//! Wire-format primitives: a fixed-capacity cursor buffer, DNS name
//! handling, and the query/NOTIFY/SOA packet framer built on top of it.

pub mod buffer;
pub mod name;
pub mod packet;

pub use buffer::{Buffer, WireError};
pub use name::Dname;

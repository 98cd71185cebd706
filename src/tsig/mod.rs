//! TSIG (RFC 8945) message authentication: key/algorithm tables plus
//! streaming sign/verify with prior-MAC chaining over a transaction.

pub mod registry;
pub mod rr;

pub use registry::{Algorithm, AlgorithmName, Key, TsigRegistry};
pub use rr::{TsigError, TsigRr, TsigStatus};

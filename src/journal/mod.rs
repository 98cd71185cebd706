//! The per-zone transfer journal: an append-only, packet-framed text file
//! that hands completed (or partial) inbound transfers to the zone-apply
//! stage, surviving a crash between any two packets.

pub mod reader;
pub mod writer;

pub use reader::{JournalReader, ParsedPacket, Update};
pub use writer::JournalWriter;

pub const BEGIN_MARKER: &str = ";;BEGINPACKET";
pub const END_MARKER: &str = ";;ENDPACKET";

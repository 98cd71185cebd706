//! Reading a zone's transfer journal one packet at a time and turning it
//! into add/delete RR updates for the zone-apply stage.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};

use super::{BEGIN_MARKER, END_MARKER};

/// One master-file RR line, tagged with whether the journal's IXFR
/// interpretation wants it added to or deleted from the zone. AXFR
/// packets only ever produce `Add`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    Add(String),
    Delete(String),
}

/// The result of successfully parsing one packet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedPacket {
    pub updates: Vec<Update>,
    /// The serial the zone should be at after this packet is applied.
    pub new_serial: u32,
}

#[derive(Debug)]
pub enum JournalReadError {
    Io(io::Error),
    /// The first RR in a packet wasn't an SOA for the apex.
    MissingLeadingSoa,
    /// A line wasn't valid master-file RR text.
    Malformed(String),
}

impl From<io::Error> for JournalReadError {
    fn from(e: io::Error) -> Self {
        JournalReadError::Io(e)
    }
}

impl std::fmt::Display for JournalReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JournalReadError::Io(e) => write!(f, "journal i/o error: {e}"),
            JournalReadError::MissingLeadingSoa => {
                write!(f, "packet did not begin with an SOA record")
            }
            JournalReadError::Malformed(line) => write!(f, "malformed journal line: {line:?}"),
        }
    }
}

impl std::error::Error for JournalReadError {}

/// Reads `<zone>.xfrd`, one packet at a time, performing crash recovery
/// (truncating a dangling `;;BEGINPACKET` with no matching
/// `;;ENDPACKET`) on open.
pub struct JournalReader {
    path: Utf8PathBuf,
    reader: BufReader<File>,
    /// Byte offset of the start of the packet currently being read, used
    /// to roll back if it turns out to be incomplete.
    packet_start_offset: u64,
}

impl JournalReader {
    pub fn open(dir: &Utf8Path, zone: &str) -> Result<Self, JournalReadError> {
        let path = dir.join(format!("{zone}.xfrd"));
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let mut reader = Self {
            path,
            reader: BufReader::new(file),
            packet_start_offset: 0,
        };
        reader.recover_incomplete_packet()?;
        Ok(reader)
    }

    /// On open, scan for a dangling `;;BEGINPACKET` with no matching
    /// `;;ENDPACKET` and truncate it away, restoring the file to the end
    /// of the last complete packet.
    fn recover_incomplete_packet(&mut self) -> Result<(), JournalReadError> {
        self.reader.get_mut().seek(SeekFrom::Start(0))?;
        let mut offset: u64 = 0;
        let mut last_complete_end: u64 = 0;
        let mut in_packet = false;
        let mut packet_start: u64 = 0;

        let mut line = String::new();
        loop {
            line.clear();
            let start_of_line = offset;
            let n = self.reader.read_line(&mut line)?;
            if n == 0 {
                break;
            }
            offset += n as u64;
            let trimmed = line.trim_end();
            if trimmed == BEGIN_MARKER {
                in_packet = true;
                packet_start = start_of_line;
            } else if trimmed == END_MARKER {
                in_packet = false;
                last_complete_end = offset;
            }
        }

        if in_packet {
            let file = self.reader.get_mut();
            file.set_len(packet_start)?;
            file.seek(SeekFrom::Start(packet_start))?;
        } else {
            let file = self.reader.get_mut();
            file.seek(SeekFrom::Start(last_complete_end))?;
        }

        self.reader = BufReader::new(self.reader.get_ref().try_clone()?);
        self.packet_start_offset = last_complete_end;
        Ok(())
    }

    /// Read and interpret the next complete packet, or `None` at
    /// end-of-file. An apex SOA with the same or a greater serial than
    /// the second record's preceding SOA means AXFR interpretation (add
    /// everything up to the closing SOA); a second RR that is an SOA with
    /// a smaller serial means IXFR interpretation (alternating delete and
    /// add blocks, flipping on each intra-packet SOA).
    pub fn next_packet(&mut self) -> Result<Option<ParsedPacket>, JournalReadError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if line.trim_end() == BEGIN_MARKER {
                break;
            }
        }

        let mut records: Vec<String> = Vec::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line)? == 0 {
                // Should not happen: `recover_incomplete_packet` already
                // dropped any dangling packet at open time.
                return Ok(None);
            }
            let trimmed = line.trim_end().to_string();
            if trimmed == END_MARKER {
                break;
            }
            records.push(trimmed);
        }

        self.interpret(records)
    }

    fn interpret(&self, records: Vec<String>) -> Result<Option<ParsedPacket>, JournalReadError> {
        if records.is_empty() {
            return Err(JournalReadError::MissingLeadingSoa);
        }

        let apex_serial = parse_soa_serial(&records[0])
            .ok_or(JournalReadError::MissingLeadingSoa)?;

        if records.len() == 1 {
            return Ok(Some(ParsedPacket {
                updates: vec![Update::Add(records[0].clone())],
                new_serial: apex_serial,
            }));
        }

        let second_serial = parse_soa_serial(&records[1]);
        let is_ixfr = matches!(second_serial, Some(s) if dns_serial_gt(apex_serial, s));

        let mut updates = Vec::with_capacity(records.len());
        updates.push(Update::Add(records[0].clone()));

        if !is_ixfr {
            for line in &records[1..] {
                updates.push(Update::Add(line.clone()));
            }
            return Ok(Some(ParsedPacket {
                updates,
                new_serial: apex_serial,
            }));
        }

        // IXFR: alternates delete / add blocks, flipping at each
        // intra-packet SOA after the first pair.
        let mut deleting = true;
        for line in &records[1..] {
            if parse_soa_serial(line).is_some() {
                deleting = !deleting;
                updates.push(Update::Add(line.clone()));
                continue;
            }
            if deleting {
                updates.push(Update::Delete(line.clone()));
            } else {
                updates.push(Update::Add(line.clone()));
            }
        }

        Ok(Some(ParsedPacket {
            updates,
            new_serial: apex_serial,
        }))
    }
}

/// RFC 1982 serial arithmetic: `DNS_SERIAL_GT(a, b)`.
pub fn dns_serial_gt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

fn parse_soa_serial(line: &str) -> Option<u32> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let soa_pos = fields.iter().position(|f| f.eq_ignore_ascii_case("SOA"))?;
    // mname, rname, serial follow the "SOA" token.
    fields.get(soa_pos + 3)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::writer::JournalWriter;

    fn soa_line(serial: u32) -> String {
        format!(
            "example.com. 3600 IN SOA ns1.example.com. hostmaster.example.com. {serial} 3600 300 604800 3600"
        )
    }

    #[test]
    fn axfr_packet_is_all_adds() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let mut writer = JournalWriter::open(dir, "example.com", true).unwrap();
        writer.begin_packet().unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap();
        writer
            .append_rr_line("example.com. 3600 IN NS ns1.example.com.")
            .unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap();
        writer.end_packet().unwrap();
        writer.finalize().unwrap();

        let mut reader = JournalReader::open(dir, "example.com").unwrap();
        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(packet.new_serial, 42);
        assert!(packet.updates.iter().all(|u| matches!(u, Update::Add(_))));
        assert!(reader.next_packet().unwrap().is_none());
    }

    #[test]
    fn ixfr_packet_alternates_delete_and_add() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();

        let mut writer = JournalWriter::open(dir, "example.com", true).unwrap();
        writer.begin_packet().unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap(); // new serial (apex)
        writer.append_rr_line(&soa_line(41)).unwrap(); // old serial: start deletes
        writer
            .append_rr_line("old.example.com. 3600 IN A 192.0.2.1")
            .unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap(); // flip to adds
        writer
            .append_rr_line("new.example.com. 3600 IN A 192.0.2.2")
            .unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap(); // closing soa
        writer.end_packet().unwrap();
        writer.finalize().unwrap();

        let mut reader = JournalReader::open(dir, "example.com").unwrap();
        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(packet.new_serial, 42);
        assert!(packet
            .updates
            .iter()
            .any(|u| matches!(u, Update::Delete(line) if line.contains("old.example.com"))));
        assert!(packet
            .updates
            .iter()
            .any(|u| matches!(u, Update::Add(line) if line.contains("new.example.com"))));
    }

    #[test]
    fn dangling_begin_packet_is_truncated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let path = dir.join("example.com.xfrd");

        let mut file = File::create(&path).unwrap();
        writeln!(file, "{BEGIN_MARKER}").unwrap();
        writeln!(file, "{}", soa_line(42)).unwrap();
        writeln!(file, "{}", soa_line(42)).unwrap();
        writeln!(file, "{END_MARKER}").unwrap();
        // A second, incomplete packet with no closing marker.
        writeln!(file, "{BEGIN_MARKER}").unwrap();
        writeln!(file, "{}", soa_line(43)).unwrap();
        drop(file);

        let mut reader = JournalReader::open(dir, "example.com").unwrap();
        let packet = reader.next_packet().unwrap().unwrap();
        assert_eq!(packet.new_serial, 42);
        assert!(reader.next_packet().unwrap().is_none());

        let remaining = std::fs::read_to_string(&path).unwrap();
        assert!(!remaining.contains("43"));
    }

    #[test]
    fn serial_gt_wraps_per_rfc_1982() {
        assert!(dns_serial_gt(2, 1));
        assert!(!dns_serial_gt(1, 2));
        assert!(dns_serial_gt(1, u32::MAX));
        assert!(!dns_serial_gt(u32::MAX, 1));
    }
}

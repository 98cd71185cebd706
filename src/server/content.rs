//! An in-memory view of a zone's current RRset plus the chain of applied
//! IXFR diffs needed to serve incremental transfers without re-reading
//! the journal on every request.
//!
//! RRs are kept pre-encoded (owner name, type, class, ttl, rdata bytes)
//! rather than as master-file text: the journal's text lines are turned
//! into this form once, by whatever applies a [`crate::journal::reader::Update`]
//! to the in-memory zone, so the server never re-parses text on the hot
//! path of answering a transfer.

use camino::Utf8Path;

use crate::journal::reader::{JournalReadError, JournalReader, ParsedPacket, Update};
use crate::wire::buffer::{Buffer, WireError};
use crate::wire::name::Dname;
use crate::wire::packet::{decode_soa_rdata, QCLASS_IN, QTYPE_SOA, SoaRecord};

/// One resource record, already encoded down to its RDATA bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RrSet {
    pub owner: Dname,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl RrSet {
    pub fn soa(owner: Dname, soa: &SoaRecord) -> Self {
        let mut buf = Buffer::new(512).expect("non-zero capacity");
        soa.encode_rdata(&mut buf).expect("soa rdata fits in 512 octets");
        let rdata = buf.as_slice()[..buf.position()].to_vec();
        Self {
            owner,
            rtype: QTYPE_SOA,
            rclass: QCLASS_IN,
            ttl: soa.minimum,
            rdata,
        }
    }

    pub fn encode(&self, buf: &mut Buffer) -> Result<(), WireError> {
        buf.write_dname(&self.owner)?;
        buf.write_u16(self.rtype)?;
        buf.write_u16(self.rclass)?;
        buf.write_u32(self.ttl)?;
        buf.write_u16(self.rdata.len() as u16)?;
        buf.write_bytes(&self.rdata)
    }

    /// Decode this RR's RDATA as an SOA, if it is one.
    pub fn as_soa(&self) -> Option<SoaRecord> {
        if self.rtype != QTYPE_SOA {
            return None;
        }
        let mut buf = Buffer::from_bytes(&self.rdata).ok()?;
        decode_soa_rdata(&mut buf).ok()
    }
}

/// One applied IXFR diff: from `from_serial` to `to_serial`, as the
/// delete block followed by the add block (the SOA bracketing is added
/// by the caller building the wire response, not stored here).
#[derive(Clone, Debug)]
pub struct AppliedDiff {
    pub from_serial: u32,
    pub to_serial: u32,
    pub deletes: Vec<RrSet>,
    pub adds: Vec<RrSet>,
}

pub struct ZoneContent {
    pub zone_name: Dname,
    pub soa: SoaRecord,
    pub records: Vec<RrSet>,
    /// Diffs kept in application order; discarded once their
    /// `from_serial` falls further back than any configured peer could
    /// plausibly still be at (left to the caller to prune).
    history: Vec<AppliedDiff>,
}

impl ZoneContent {
    pub fn new(zone_name: Dname, soa: SoaRecord, records: Vec<RrSet>) -> Self {
        Self {
            zone_name,
            soa,
            records,
            history: Vec::new(),
        }
    }

    pub fn record_diff(&mut self, diff: AppliedDiff) {
        self.history.push(diff);
    }

    /// Build the full chain of diffs from `from_serial` up to the
    /// current serial, interleaved with the SOA that marks each
    /// transition, or `None` if any link is missing from history (the
    /// caller should fall back to a full AXFR).
    pub fn diff_since(&self, from_serial: u32) -> Option<Vec<RrSet>> {
        if from_serial == self.soa.serial {
            return Some(Vec::new());
        }

        let mut chain = Vec::new();
        let mut cursor = from_serial;
        loop {
            let step = self
                .history
                .iter()
                .find(|d| d.from_serial == cursor)?;
            chain.push(step);
            cursor = step.to_serial;
            if cursor == self.soa.serial {
                break;
            }
        }

        let mut out = Vec::new();
        for step in chain {
            out.push(RrSet::soa(self.zone_name.clone(), &self.soa));
            out.extend(step.deletes.iter().cloned());
            out.push(RrSet::soa(self.zone_name.clone(), &self.soa));
            out.extend(step.adds.iter().cloned());
        }
        Some(out)
    }

    /// Rebuild a zone's in-memory content from its on-disk journal: the
    /// first packet establishes the baseline RRset, every packet after
    /// that is folded in as a diff. Returns `Ok(None)` if the zone has
    /// never completed a transfer and so has no journal file yet.
    pub fn from_journal(
        dir: &Utf8Path,
        zone: &str,
        zone_name: &Dname,
    ) -> Result<Option<Self>, JournalReadError> {
        let mut reader = match JournalReader::open(dir, zone) {
            Ok(reader) => reader,
            Err(JournalReadError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let mut content: Option<ZoneContent> = None;
        while let Some(packet) = reader.next_packet()? {
            match content.as_mut() {
                None => content = Some(Self::from_first_packet(zone_name.clone(), packet)?),
                Some(existing) => existing.apply_packet(packet)?,
            }
        }
        Ok(content)
    }

    fn from_first_packet(zone_name: Dname, packet: ParsedPacket) -> Result<Self, JournalReadError> {
        let mut records = Vec::new();
        let mut soa = None;
        for update in &packet.updates {
            let line = match update {
                Update::Add(line) | Update::Delete(line) => line,
            };
            let rr = parse_master_line(line).ok_or_else(|| JournalReadError::Malformed(line.clone()))?;
            if rr.rtype == QTYPE_SOA {
                soa = rr.as_soa().or(soa);
                continue;
            }
            records.push(rr);
        }
        let soa = soa.ok_or(JournalReadError::MissingLeadingSoa)?;
        Ok(Self::new(zone_name, soa, records))
    }

    /// Fold one subsequent journal packet into this content as a diff.
    /// Intra-packet SOA lines are structural markers and are never
    /// treated as real zone content, even when the journal reader tagged
    /// them `Delete` (the reader always tags the marker SOAs `Add`, but
    /// nothing here depends on that).
    fn apply_packet(&mut self, packet: ParsedPacket) -> Result<(), JournalReadError> {
        let from_serial = self.soa.serial;
        let mut deletes = Vec::new();
        let mut adds = Vec::new();
        let mut new_soa = None;

        for update in &packet.updates {
            let (line, is_delete) = match update {
                Update::Add(line) => (line, false),
                Update::Delete(line) => (line, true),
            };
            let rr = parse_master_line(line).ok_or_else(|| JournalReadError::Malformed(line.clone()))?;
            if rr.rtype == QTYPE_SOA {
                new_soa = rr.as_soa().or(new_soa);
                continue;
            }
            if is_delete {
                self.records.retain(|existing| existing != &rr);
                deletes.push(rr);
            } else {
                self.records.push(rr.clone());
                adds.push(rr);
            }
        }

        self.soa = new_soa.ok_or(JournalReadError::MissingLeadingSoa)?;
        self.record_diff(AppliedDiff {
            from_serial,
            to_serial: packet.new_serial,
            deletes,
            adds,
        });
        Ok(())
    }
}

/// Parse one master-file RR line written by [`crate::wire::packet::rr_to_master_line`]:
/// either the spelled-out SOA form or the RFC 3597 generic form.
fn parse_master_line(line: &str) -> Option<RrSet> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }
    let owner = Dname::from_text(fields[0]).ok()?;
    let ttl: u32 = fields[1].parse().ok()?;

    if fields[2].eq_ignore_ascii_case("IN") && fields[3].eq_ignore_ascii_case("SOA") {
        if fields.len() < 11 {
            return None;
        }
        let soa = SoaRecord {
            mname: Dname::from_text(fields[4]).ok()?,
            rname: Dname::from_text(fields[5]).ok()?,
            serial: fields[6].parse().ok()?,
            refresh: fields[7].parse().ok()?,
            retry: fields[8].parse().ok()?,
            expire: fields[9].parse().ok()?,
            minimum: fields[10].parse().ok()?,
        };
        return Some(RrSet::soa(owner, &soa));
    }

    let rclass: u16 = fields[2].strip_prefix("CLASS")?.parse().ok()?;
    let rtype: u16 = fields[3].strip_prefix("TYPE")?.parse().ok()?;
    if fields.get(4) != Some(&"\\#") {
        return None;
    }
    let len: usize = fields.get(5)?.parse().ok()?;
    let hex = fields.get(6).copied().unwrap_or("");
    if hex.len() != len * 2 {
        return None;
    }
    let mut rdata = Vec::with_capacity(len);
    let mut chars = hex.chars();
    for _ in 0..len {
        let hi = chars.next()?;
        let lo = chars.next()?;
        rdata.push(u8::from_str_radix(&format!("{hi}{lo}"), 16).ok()?);
    }
    Some(RrSet { owner, rtype, rclass, ttl, rdata })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn soa(serial: u32) -> SoaRecord {
        SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        }
    }

    fn a_record(owner: &str) -> RrSet {
        RrSet {
            owner: Dname::from_text(owner).unwrap(),
            rtype: 1,
            rclass: QCLASS_IN,
            ttl: 3600,
            rdata: vec![192, 0, 2, 1],
        }
    }

    fn apex() -> Dname {
        Dname::from_text("example.com.").unwrap()
    }

    #[test]
    fn diff_since_current_serial_is_empty() {
        let content = ZoneContent::new(apex(), soa(5), vec![]);
        assert_eq!(content.diff_since(5), Some(vec![]));
    }

    #[test]
    fn missing_link_falls_back_to_none() {
        let content = ZoneContent::new(apex(), soa(5), vec![]);
        assert_eq!(content.diff_since(3), None);
    }

    #[test]
    fn single_hop_diff_chains_through_history() {
        let mut content = ZoneContent::new(apex(), soa(6), vec![]);
        content.record_diff(AppliedDiff {
            from_serial: 5,
            to_serial: 6,
            deletes: vec![a_record("old.example.com.")],
            adds: vec![a_record("new.example.com.")],
        });
        let diff = content.diff_since(5).unwrap();
        assert!(diff.iter().any(|rr| rr.owner.to_text() == "old.example.com."));
        assert!(diff.iter().any(|rr| rr.owner.to_text() == "new.example.com."));
    }

    #[test]
    fn missing_journal_rebuilds_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        assert!(ZoneContent::from_journal(dir, "example.com", &apex()).unwrap().is_none());
    }

    #[test]
    fn rebuilds_from_an_axfr_then_an_ixfr_packet() {
        use crate::journal::writer::JournalWriter;

        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8Path::from_path(dir.path()).unwrap();
        let soa_line = |serial: u32| {
            format!(
                "example.com. 3600 IN SOA ns1.example.com. hostmaster.example.com. {serial} 3600 300 604800 3600"
            )
        };

        let mut writer = JournalWriter::open(dir, "example.com", true).unwrap();
        writer.begin_packet().unwrap();
        writer.append_rr_line(&soa_line(41)).unwrap();
        writer
            .append_rr_line("old.example.com. 3600 CLASS1 TYPE1 \\# 4 c0000201")
            .unwrap();
        writer.append_rr_line(&soa_line(41)).unwrap();
        writer.end_packet().unwrap();
        writer.finalize().unwrap();

        let mut writer = JournalWriter::open(dir, "example.com", false).unwrap();
        writer.begin_packet().unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap();
        writer.append_rr_line(&soa_line(41)).unwrap();
        writer
            .append_rr_line("old.example.com. 3600 CLASS1 TYPE1 \\# 4 c0000201")
            .unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap();
        writer
            .append_rr_line("new.example.com. 3600 CLASS1 TYPE1 \\# 4 c0000202")
            .unwrap();
        writer.append_rr_line(&soa_line(42)).unwrap();
        writer.end_packet().unwrap();
        writer.finalize().unwrap();

        let content = ZoneContent::from_journal(dir, "example.com", &apex())
            .unwrap()
            .unwrap();
        assert_eq!(content.soa.serial, 42);
        assert!(!content.records.iter().any(|rr| rr.owner.to_text() == "old.example.com."));
        assert!(content.records.iter().any(|rr| rr.owner.to_text() == "new.example.com."));
        assert_eq!(content.diff_since(41).unwrap().len(), 4);
    }
}

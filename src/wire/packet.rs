//! Encoding DNS queries and NOTIFY messages, and decoding SOA RDATA.

use super::buffer::{Buffer, Result};
use super::name::Dname;

pub const QTYPE_SOA: u16 = 6;
pub const QTYPE_AXFR: u16 = 252;
pub const QTYPE_IXFR: u16 = 251;
pub const QCLASS_IN: u16 = 1;

pub const OPCODE_QUERY: u8 = 0;
pub const OPCODE_NOTIFY: u8 = 4;

//----------- SoaRecord ----------------------------------------------------------

/// The timer-bearing fields of an SOA record, decoded from RDATA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoaRecord {
    pub mname: Dname,
    pub rname: Dname,
    pub serial: u32,
    pub refresh: u32,
    pub retry: u32,
    pub expire: u32,
    pub minimum: u32,
}

impl SoaRecord {
    /// Encode into the RDATA form (no leading rdlength; caller writes
    /// that separately once the length is known).
    pub fn encode_rdata(&self, buf: &mut Buffer) -> Result<()> {
        buf.write_dname(&self.mname)?;
        buf.write_dname(&self.rname)?;
        buf.write_u32(self.serial)?;
        buf.write_u32(self.refresh)?;
        buf.write_u32(self.retry)?;
        buf.write_u32(self.expire)?;
        buf.write_u32(self.minimum)
    }
}

/// Decode an SOA's RDATA at the buffer's current position. The caller is
/// responsible for having already validated `rdlength` against the
/// remaining bytes; this only range-checks against `limit`.
pub fn decode_soa_rdata(buf: &mut Buffer) -> Result<SoaRecord> {
    let mname = buf.read_dname()?;
    let rname = buf.read_dname()?;
    let serial = buf.read_u32()?;
    let refresh = buf.read_u32()?;
    let retry = buf.read_u32()?;
    let expire = buf.read_u32()?;
    let minimum = buf.read_u32()?;
    Ok(SoaRecord {
        mname,
        rname,
        serial,
        refresh,
        retry,
        expire,
        minimum,
    })
}

//----------- Generic RR decoding / presentation ----------------------------------

/// One resource record read off the wire without any type-specific
/// decoding: just enough to forward it into the journal or re-encode it.
#[derive(Clone, Debug)]
pub struct WireRr {
    pub owner: Dname,
    pub rtype: u16,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

/// Read one full RR (name, type, class, ttl, rdlength, rdata) at the
/// buffer's current position.
pub fn read_rr(buf: &mut Buffer) -> Result<WireRr> {
    let owner = buf.read_dname()?;
    let rtype = buf.read_u16()?;
    let rclass = buf.read_u16()?;
    let ttl = buf.read_u32()?;
    let rdlength = buf.read_u16()? as usize;
    let rdata = buf.read_bytes(rdlength)?.to_vec();
    Ok(WireRr { owner, rtype, rclass, ttl, rdata })
}

/// Render an RR as one master-file-format line, for the journal.
///
/// An SOA is rendered with its fields spelled out since the journal
/// reader's serial comparison depends on being able to find the `SOA`
/// token and its third field; every other type is rendered using RFC
/// 3597 generic-RR syntax (`CLASS<n> TYPE<n> \# <len> <hex>`), since
/// decoding every RR type the wire protocol can carry into its native
/// presentation form is out of scope here and the generic form round
/// trips losslessly through any conformant zone parser.
pub fn rr_to_master_line(rr: &WireRr) -> String {
    if rr.rtype == QTYPE_SOA {
        if let Ok(mut buf) = Buffer::from_bytes(&rr.rdata) {
            if let Ok(soa) = decode_soa_rdata(&mut buf) {
                return format!(
                    "{} {} IN SOA {} {} {} {} {} {} {}",
                    rr.owner, rr.ttl, soa.mname, soa.rname, soa.serial, soa.refresh,
                    soa.retry, soa.expire, soa.minimum
                );
            }
        }
    }

    let hex: String = rr.rdata.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{} {} CLASS{} TYPE{} \\# {} {}",
        rr.owner, rr.ttl, rr.rclass, rr.rtype, rr.rdata.len(), hex
    )
}

//----------- Query / NOTIFY encoding ---------------------------------------------

/// Encode a standard DNS query: random id (caller supplies it so tests
/// can be deterministic), the given opcode, `QD=1`, all other counts
/// zero, and a single question of `(name, qtype, qclass)`.
pub fn encode_query(
    buf: &mut Buffer,
    id: u16,
    opcode: u8,
    name: &Dname,
    qtype: u16,
    qclass: u16,
) -> Result<()> {
    buf.write_u16(id)?;
    buf.write_u8(0)?;
    buf.write_u8(0)?;
    buf.write_u16(1)?; // qdcount
    buf.write_u16(0)?; // ancount
    buf.write_u16(0)?; // nscount
    buf.write_u16(0)?; // arcount

    buf.set_opcode(opcode)?;
    buf.set_rd(opcode == OPCODE_QUERY)?;

    buf.write_dname(name)?;
    buf.write_u16(qtype)?;
    buf.write_u16(qclass)
}

/// Encode a NOTIFY: a query with `OPCODE=NOTIFY`, `AA=1`, and optionally
/// the zone's current SOA placed in the answer section (`ANCOUNT=1`) so
/// the receiver doesn't need a round trip to learn the new serial.
pub fn encode_notify(
    buf: &mut Buffer,
    id: u16,
    zone: &Dname,
    soa: Option<&SoaRecord>,
) -> Result<()> {
    encode_query(buf, id, OPCODE_NOTIFY, zone, QTYPE_SOA, QCLASS_IN)?;
    buf.set_aa(true)?;

    if let Some(soa) = soa {
        buf.set_ancount(1)?;
        buf.write_dname(zone)?;
        buf.write_u16(QTYPE_SOA)?;
        buf.write_u16(QCLASS_IN)?;
        buf.write_u32(0)?; // ttl
        let rdlength_pos = buf.position();
        buf.write_u16(0)?; // placeholder rdlength
        let rdata_start = buf.position();
        soa.encode_rdata(buf)?;
        let rdlength = (buf.position() - rdata_start) as u16;
        buf.write_u16_at(rdlength_pos, rdlength)?;
    }

    Ok(())
}

/// Returns true if a decoded response looks like a valid NOTIFY reply to
/// our own request: `QR=1`, `OPCODE=NOTIFY`, the id matches, and the
/// rcode isn't `NOTIMPL`.
pub fn is_notify_reply(buf: &Buffer, expected_id: u16) -> Result<bool> {
    const RCODE_NOTIMPL: u8 = 4;
    Ok(buf.header_id()? == expected_id
        && buf.qr()?
        && buf.opcode()? == OPCODE_NOTIFY
        && buf.rcode()? != RCODE_NOTIMPL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_round_trips_header_fields() {
        let mut buf = Buffer::new(512).unwrap();
        let name = Dname::from_text("example.com.").unwrap();
        encode_query(&mut buf, 0xabcd, OPCODE_QUERY, &name, QTYPE_SOA, QCLASS_IN).unwrap();
        buf.flip();

        assert_eq!(buf.header_id().unwrap(), 0xabcd);
        assert!(!buf.qr().unwrap());
        assert_eq!(buf.opcode().unwrap(), OPCODE_QUERY);
        assert_eq!(buf.qdcount().unwrap(), 1);
        assert_eq!(buf.ancount().unwrap(), 0);
        assert_eq!(buf.nscount().unwrap(), 0);
        assert_eq!(buf.arcount().unwrap(), 0);

        buf.skip(12).unwrap();
        let decoded_name = buf.read_dname().unwrap();
        assert!(decoded_name.eq_ignore_case(&name));
        assert_eq!(buf.read_u16().unwrap(), QTYPE_SOA);
        assert_eq!(buf.read_u16().unwrap(), QCLASS_IN);
    }

    #[test]
    fn notify_sets_opcode_and_aa_with_soa_answer() {
        let mut buf = Buffer::new(512).unwrap();
        let zone = Dname::from_text("example.com.").unwrap();
        let soa = SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial: 42,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        };
        encode_notify(&mut buf, 1, &zone, Some(&soa)).unwrap();
        buf.flip();

        assert_eq!(buf.opcode().unwrap(), OPCODE_NOTIFY);
        assert!(buf.aa().unwrap());
        assert_eq!(buf.ancount().unwrap(), 1);
    }

    #[test]
    fn reads_a_generic_rr_and_renders_it_rfc3597_style() {
        let mut buf = Buffer::new(512).unwrap();
        let owner = Dname::from_text("www.example.com.").unwrap();
        buf.write_dname(&owner).unwrap();
        buf.write_u16(1).unwrap(); // A
        buf.write_u16(QCLASS_IN).unwrap();
        buf.write_u32(3600).unwrap();
        buf.write_u16(4).unwrap();
        buf.write_bytes(&[192, 0, 2, 1]).unwrap();
        buf.flip();

        let rr = read_rr(&mut buf).unwrap();
        assert_eq!(rr.rtype, 1);
        assert_eq!(rr_to_master_line(&rr), "www.example.com. 3600 CLASS1 TYPE1 \\# 4 c0000201");
    }

    #[test]
    fn renders_an_soa_rr_with_its_fields_spelled_out() {
        let owner = Dname::from_text("example.com.").unwrap();
        let soa = SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial: 42,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        };
        let mut buf = Buffer::new(512).unwrap();
        soa.encode_rdata(&mut buf).unwrap();
        let rdata = buf.as_slice()[..buf.position()].to_vec();

        let rr = WireRr { owner, rtype: QTYPE_SOA, rclass: QCLASS_IN, ttl: 3600, rdata };
        let line = rr_to_master_line(&rr);
        assert!(line.contains("SOA ns1.example.com. hostmaster.example.com. 42 3600 300 604800 3600"));
    }

    #[test]
    fn soa_rdata_round_trips() {
        let mut buf = Buffer::new(512).unwrap();
        let soa = SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial: 42,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        };
        soa.encode_rdata(&mut buf).unwrap();
        buf.flip();
        let decoded = decode_soa_rdata(&mut buf).unwrap();
        assert_eq!(decoded, soa);
    }
}

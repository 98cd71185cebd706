//! The outbound AXFR/IXFR server: authorizes inbound transfer requests
//! against a zone's ACL, verifies any TSIG, and streams the zone (or an
//! IXFR diff) back, fragmenting across as many packets as the transport
//! requires and chaining TSIG across them.

pub mod content;

use crate::acl::{AclChain, VerifiedTsig};
use crate::tsig::rr::{FoundTsig, TsigError, TsigRr, TsigStatus, ERROR_BADSIG};
use crate::tsig::registry::TsigRegistry;
use crate::wire::buffer::{Buffer, WireError};
use crate::wire::name::Dname;
use crate::wire::packet::{QCLASS_IN, QTYPE_AXFR, QTYPE_IXFR};

use content::{RrSet, ZoneContent};

/// A transfer request's outcome before any bytes are produced.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestDecision {
    Refused,
    ServeAxfr,
    ServeIxfr,
}

/// The maximum number of answer RRs packed into one outgoing message
/// before starting a new one, keeping well under the 64KiB TCP framing
/// ceiling for any realistic RR size.
pub const MAX_RRS_PER_PACKET: usize = 100;

pub fn decide(
    acl: &AclChain,
    peer_ip: std::net::IpAddr,
    peer_port: u16,
    verified_tsig: &Option<VerifiedTsig>,
    qtype: u16,
) -> RequestDecision {
    if !acl.allows(peer_ip, peer_port, verified_tsig) {
        return RequestDecision::Refused;
    }
    match qtype {
        QTYPE_AXFR => RequestDecision::ServeAxfr,
        QTYPE_IXFR => RequestDecision::ServeIxfr,
        _ => RequestDecision::Refused,
    }
}

/// Build the sequence of outgoing wire messages for an AXFR: the zone's
/// RRs bracketed by an opening and closing SOA, at most
/// [`MAX_RRS_PER_PACKET`] records per message. Each message is signed in
/// sequence via `tsig`, which (per RFC 8945) digests only the timers on
/// every message after the first once a key is in use.
/// A transfer's TSIG context: the live transaction state plus the owner
/// names to write into each appended TSIG RR.
pub struct ResponseTsig<'a> {
    pub tsig: &'a mut TsigRr,
    pub key_name: &'a Dname,
    pub algorithm_name: &'a Dname,
}

pub fn build_axfr(
    query_id: u16,
    zone_name: &Dname,
    content: &ZoneContent,
    tsig: Option<&mut ResponseTsig>,
    now: u64,
) -> Result<Vec<Vec<u8>>, WireError> {
    let opening_soa = RrSet::soa(zone_name.clone(), &content.soa);
    let mut all_rrs: Vec<&RrSet> = Vec::with_capacity(content.records.len() + 2);
    all_rrs.push(&opening_soa);
    all_rrs.extend(content.records.iter());
    all_rrs.push(&opening_soa);

    encode_messages(query_id, zone_name, QTYPE_AXFR, &all_rrs, tsig, now)
}

/// Build an IXFR diff from `from_serial` to the zone's current serial,
/// `(old SOA, deletes..., new SOA, adds...)` per RFC 1995, provided the
/// journal covers that range; the caller falls back to [`build_axfr`]
/// when [`content::ZoneContent::diff_since`] returns `None`.
pub fn build_ixfr(
    query_id: u16,
    zone_name: &Dname,
    content: &ZoneContent,
    from_serial: u32,
    tsig: Option<&mut ResponseTsig>,
    now: u64,
) -> Option<Result<Vec<Vec<u8>>, WireError>> {
    let diff = content.diff_since(from_serial)?;

    let current_soa = RrSet::soa(zone_name.clone(), &content.soa);
    let mut all_rrs: Vec<&RrSet> = Vec::with_capacity(diff.len() + 2);
    all_rrs.push(&current_soa);
    all_rrs.extend(diff.iter());
    all_rrs.push(&current_soa);

    Some(encode_messages(query_id, zone_name, QTYPE_IXFR, &all_rrs, tsig, now))
}

fn encode_messages(
    query_id: u16,
    zone_name: &Dname,
    qtype: u16,
    rrs: &[&RrSet],
    mut tsig: Option<&mut ResponseTsig>,
    now: u64,
) -> Result<Vec<Vec<u8>>, WireError> {
    let mut messages = Vec::new();

    for chunk in rrs.chunks(MAX_RRS_PER_PACKET) {
        let mut buf = Buffer::new(16 * 1024)?;
        write_response_header(&mut buf, query_id, zone_name, qtype, chunk.len() as u16)?;
        for rr in chunk {
            rr.encode(&mut buf)?;
        }

        if let Some(ctx) = tsig.as_mut() {
            sign_and_append(&mut buf, ctx.tsig, ctx.key_name, ctx.algorithm_name, now)?;
        }

        buf.flip();
        messages.push(buf.as_slice().to_vec());
    }
    Ok(messages)
}

fn write_response_header(
    buf: &mut Buffer,
    query_id: u16,
    zone_name: &Dname,
    qtype: u16,
    ancount: u16,
) -> Result<(), WireError> {
    buf.set_header_id(query_id)?;
    buf.set_qr(true)?;
    buf.set_aa(true)?;
    buf.set_qdcount(1)?;
    buf.set_ancount(ancount)?;
    buf.set_position(12)?;
    buf.write_dname(zone_name)?;
    buf.write_u16(qtype)?;
    buf.write_u16(QCLASS_IN)
}

fn sign_and_append(
    buf: &mut Buffer,
    tsig: &mut TsigRr,
    key_name: &Dname,
    algorithm_name: &Dname,
    now: u64,
) -> Result<(), WireError> {
    let query_id = buf.header_id()?;
    let wire = buf.written_slice().to_vec();
    tsig.prepare(query_id).map_err(|_| WireError::Overrun)?;
    tsig.update(&wire, wire.len()).map_err(|_| WireError::Overrun)?;
    let mac = tsig.sign(now, &[]).map_err(|_| WireError::Overrun)?;
    tsig.append(buf, key_name, algorithm_name, now, &mac, &[])
        .map_err(|_| WireError::Overrun)
}

/// Read the query's type from its single question section (after the
/// caller has reset the buffer's position to the start of the message).
pub fn classify_query_rrtype(buf: &mut Buffer) -> Result<u16, WireError> {
    buf.set_position(12)?;
    buf.skip_dname()?;
    buf.read_u16()
}

/// The live TSIG transaction left behind by a successful [`verify_incoming_tsig`]
/// call, reusable to sign the response chained to the request's MAC per
/// RFC 8945 §5.3.1 rather than starting a fresh, unchained signature.
pub struct InboundTsigTransaction {
    pub tsig: TsigRr,
    pub key_name: Dname,
    pub algorithm_name: Dname,
}

/// Locate and verify an inbound request's trailing TSIG, if any. The
/// caller must have already read past the question section and any
/// answer/authority RRs so the buffer sits at the first additional
/// record.
///
/// On a successful verification the returned transaction carries the
/// request's prior MAC, so passing it straight into [`build_axfr`] or
/// [`build_ixfr`] as a [`ResponseTsig`] chains the response's signature to
/// the request's as RFC 8945 requires. A present-but-invalid TSIG (bad key,
/// bad signature, bad time) still yields a [`VerifiedTsig`] for the ACL
/// check, but no transaction to sign a response with.
pub fn verify_incoming_tsig(
    buf: &mut Buffer,
    registry: &TsigRegistry,
    now: u64,
) -> Result<Option<(VerifiedTsig, Option<InboundTsigTransaction>)>, TsigError> {
    let Some(found): Option<FoundTsig> = TsigRr::find(buf)? else {
        return Ok(None);
    };

    let signed_prefix = &buf.as_slice()[..found.rr_start];
    match TsigRr::lookup(&found, registry, now) {
        Ok((key, algorithm)) => {
            let mut verifier = TsigRr::new();
            let status = verifier.verify(signed_prefix, &found, &key, algorithm);
            let summary = VerifiedTsig {
                status,
                key_name: key.name.clone(),
                algorithm_name: algorithm.name.wire_name().to_string(),
                rcode: if status == TsigStatus::Ok { 0 } else { ERROR_BADSIG as u8 },
            };
            let transaction = (status == TsigStatus::Ok).then(|| InboundTsigTransaction {
                tsig: verifier,
                key_name: found.key_name.clone(),
                algorithm_name: found.algorithm_name.clone(),
            });
            Ok(Some((summary, transaction)))
        }
        Err(status) => Ok(Some((
            VerifiedTsig {
                status,
                key_name: found.key_name.to_text(),
                algorithm_name: found.algorithm_name.to_text(),
                rcode: ERROR_BADSIG as u8,
            },
            None,
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::AclEntry;
    use crate::wire::packet::SoaRecord;

    fn zone_content() -> ZoneContent {
        let soa = SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial: 5,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        };
        let a_record = RrSet {
            owner: Dname::from_text("www.example.com.").unwrap(),
            rtype: 1,
            rclass: QCLASS_IN,
            ttl: 3600,
            rdata: vec![192, 0, 2, 1],
        };
        ZoneContent::new(Dname::from_text("example.com.").unwrap(), soa, vec![a_record])
    }

    #[test]
    fn axfr_brackets_records_with_opening_and_closing_soa() {
        let zone_name = Dname::from_text("example.com.").unwrap();
        let content = zone_content();
        let messages = build_axfr(1, &zone_name, &content, None, 0).unwrap();
        assert_eq!(messages.len(), 1);

        let mut buf = Buffer::from_bytes(&messages[0]).unwrap();
        assert_eq!(buf.ancount().unwrap(), 3); // soa, A, soa
    }

    #[test]
    fn unauthorized_peer_is_refused() {
        let acl = AclChain::new(vec![AclEntry::single("192.0.2.1".parse().unwrap())]);
        let decision = decide(&acl, "203.0.113.1".parse().unwrap(), 4000, &None, QTYPE_AXFR);
        assert_eq!(decision, RequestDecision::Refused);
    }

    #[test]
    fn authorized_peer_gets_axfr_decision() {
        let acl = AclChain::new(vec![AclEntry::single("192.0.2.1".parse().unwrap())]);
        let decision = decide(&acl, "192.0.2.1".parse().unwrap(), 4000, &None, QTYPE_AXFR);
        assert_eq!(decision, RequestDecision::ServeAxfr);
    }

    #[test]
    fn ixfr_without_history_falls_back_to_none() {
        let zone_name = Dname::from_text("example.com.").unwrap();
        let content = zone_content();
        assert!(build_ixfr(1, &zone_name, &content, 1, None, 0).is_none());
    }
}

//! Classifying transfer responses and driving a zone's engine through its
//! master rotation, independent of how the bytes for a given attempt were
//! actually obtained (UDP IXFR probe vs. TCP AXFR/IXFR).

use crate::journal::reader::dns_serial_gt;
use crate::wire::buffer::{Buffer, WireError};
use crate::wire::packet::{decode_soa_rdata, QCLASS_IN, QTYPE_AXFR, QTYPE_IXFR, QTYPE_SOA};

use super::zone::{RefreshTimerState, XFRD_MAX_ROUNDS};
use super::ZoneState;

/// What a single transfer attempt (one UDP datagram or one TCP byte
/// stream, fully reassembled) turned out to be.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Malformed, wrong query id, TSIG failure, or a DNS error rcode.
    Bad,
    /// A well-formed IXFR response fragment; more packets are expected
    /// over the same TCP connection.
    More,
    /// The master doesn't support the requested transfer type
    /// (`NOTIMP`); fall back to AXFR.
    NotImpl,
    /// The master truncated a UDP response; retry over TCP.
    Tc,
    /// A complete, self-consistent AXFR or IXFR.
    Xfr,
    /// The response was just an SOA with a serial no newer than ours —
    /// nothing to transfer.
    NewLease,
}

/// Per-zone counters and last-known state exposed over the control
/// socket's `status` command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub zone: String,
    pub serial_disk: Option<u32>,
    pub serial_notify: Option<u32>,
    pub timer: RefreshTimerState,
    pub round: u32,
}

pub struct ZoneEngine<'a> {
    pub state: &'a mut ZoneState,
}

impl<'a> ZoneEngine<'a> {
    pub fn new(state: &'a mut ZoneState) -> Self {
        Self { state }
    }

    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot {
            zone: self.state.name.clone(),
            serial_disk: self.state.current_serial(),
            serial_notify: self.state.serial_notify,
            timer: self.state.timer.clone(),
            round: self.state.round,
        }
    }

    /// Classify a single reassembled response for `qtype` sent as query
    /// id `query_id`. Only inspects header fields and the first answer
    /// RR's SOA, the minimum needed to route the transfer; the caller is
    /// responsible for TSIG verification before this is called. Any wire
    /// parsing failure collapses to [`PacketOutcome::Bad`].
    pub fn classify(buf: &mut Buffer, query_id: u16, qtype: u16, known_serial: Option<u32>) -> PacketOutcome {
        Self::try_classify(buf, query_id, qtype, known_serial).unwrap_or(PacketOutcome::Bad)
    }

    fn try_classify(
        buf: &mut Buffer,
        query_id: u16,
        qtype: u16,
        known_serial: Option<u32>,
    ) -> Result<PacketOutcome, WireError> {
        if buf.header_id()? != query_id || !buf.qr()? {
            return Ok(PacketOutcome::Bad);
        }
        let rcode = buf.rcode()?;
        if rcode == 4 {
            return Ok(PacketOutcome::NotImpl);
        }
        if rcode != 0 {
            return Ok(PacketOutcome::Bad);
        }
        if buf.tc()? {
            return Ok(PacketOutcome::Tc);
        }
        let ancount = buf.ancount()?;
        if ancount == 0 {
            return Ok(PacketOutcome::Bad);
        }

        buf.set_position(12)?;
        for _ in 0..buf.qdcount()? {
            buf.skip_dname()?;
            buf.skip(4)?;
        }

        buf.skip_dname()?;
        let rrtype = buf.read_u16()?;
        let rrclass = buf.read_u16()?;
        if rrtype != QTYPE_SOA || rrclass != QCLASS_IN {
            return Ok(PacketOutcome::Bad);
        }
        let _ttl = buf.read_u32()?;
        let rdlength = buf.read_u16()?;
        let rdata_start = buf.position();
        let soa = decode_soa_rdata(buf)?;
        if buf.position() != rdata_start + rdlength as usize {
            return Ok(PacketOutcome::Bad);
        }

        if let Some(known) = known_serial {
            if soa.serial == known {
                return Ok(PacketOutcome::NewLease);
            }
            if !dns_serial_gt(soa.serial, known) {
                return Ok(PacketOutcome::Bad);
            }
        }

        if ancount == 1 {
            // SOA-only answer: an IXFR response telling us our serial is
            // already current.
            return Ok(PacketOutcome::NewLease);
        }

        if qtype == QTYPE_IXFR && ancount > 1 {
            // An IXFR body continues across a second SOA if it's not the
            // closing one; `More` vs `Xfr` is a TCP-stream-level decision
            // the caller makes after reassembling every answer RR.
            return Ok(PacketOutcome::Xfr);
        }

        if qtype == QTYPE_AXFR {
            return Ok(PacketOutcome::Xfr);
        }

        Ok(PacketOutcome::More)
    }

    /// Advance the master rotation after a failed attempt against
    /// `master_index`. Returns the next master to try, or `None` if every
    /// master has now been tried `XFRD_MAX_ROUNDS` times this round.
    pub fn next_master(&mut self, master_index: usize) -> Option<usize> {
        let next = (master_index + 1) % self.state.masters.len().max(1);
        if next == 0 {
            self.state.round += 1;
        }
        if self.state.round >= XFRD_MAX_ROUNDS {
            None
        } else {
            Some(next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::packet::{encode_query, SoaRecord};

    fn make_response(query_id: u16, rcode: u8, ancount_extra_soa: bool, serial: u32) -> Buffer {
        let mut buf = Buffer::new(512).unwrap();
        let name = crate::wire::name::Dname::from_text("example.com.").unwrap();
        encode_query(&mut buf, query_id, crate::wire::packet::OPCODE_QUERY, &name, QTYPE_AXFR, QCLASS_IN).unwrap();
        buf.set_qr(true).unwrap();
        buf.set_rcode(rcode).unwrap();

        if rcode == 0 {
            buf.set_ancount(if ancount_extra_soa { 2 } else { 1 }).unwrap();
            let soa = SoaRecord {
                mname: crate::wire::name::Dname::from_text("ns1.example.com.").unwrap(),
                rname: crate::wire::name::Dname::from_text("hostmaster.example.com.").unwrap(),
                serial,
                refresh: 3600,
                retry: 300,
                expire: 604_800,
                minimum: 3600,
            };

            buf.write_dname(&name).unwrap();
            buf.write_u16(QTYPE_SOA).unwrap();
            buf.write_u16(QCLASS_IN).unwrap();
            buf.write_u32(3600).unwrap();
            let rdata_len_pos = buf.position();
            buf.write_u16(0).unwrap();
            let rdata_start = buf.position();
            soa.encode_rdata(&mut buf).unwrap();
            let rdata_len = (buf.position() - rdata_start) as u16;
            buf.write_u16_at(rdata_len_pos, rdata_len).unwrap();

            if ancount_extra_soa {
                buf.write_dname(&name).unwrap();
                buf.write_u16(QTYPE_SOA).unwrap();
                buf.write_u16(QCLASS_IN).unwrap();
                buf.write_u32(3600).unwrap();
                let rdata_len_pos = buf.position();
                buf.write_u16(0).unwrap();
                let rdata_start = buf.position();
                soa.encode_rdata(&mut buf).unwrap();
                let rdata_len = (buf.position() - rdata_start) as u16;
                buf.write_u16_at(rdata_len_pos, rdata_len).unwrap();
            }
        }
        buf.flip();
        buf
    }

    #[test]
    fn same_serial_is_new_lease() {
        let mut buf = make_response(7, 0, false, 10);
        let outcome = ZoneEngine::classify(&mut buf, 7, QTYPE_AXFR, Some(10));
        assert_eq!(outcome, PacketOutcome::NewLease);
    }

    #[test]
    fn newer_serial_axfr_is_xfr() {
        let mut buf = make_response(7, 0, true, 11);
        let outcome = ZoneEngine::classify(&mut buf, 7, QTYPE_AXFR, Some(10));
        assert_eq!(outcome, PacketOutcome::Xfr);
    }

    #[test]
    fn notimpl_rcode_signals_fallback() {
        let mut buf = make_response(7, 4, false, 10);
        let outcome = ZoneEngine::classify(&mut buf, 7, QTYPE_IXFR, Some(10));
        assert_eq!(outcome, PacketOutcome::NotImpl);
    }

    #[test]
    fn mismatched_query_id_is_bad() {
        let mut buf = make_response(7, 0, false, 11);
        let outcome = ZoneEngine::classify(&mut buf, 99, QTYPE_AXFR, Some(10));
        assert_eq!(outcome, PacketOutcome::Bad);
    }

    #[test]
    fn master_rotation_bumps_round_on_wraparound() {
        let config = crate::config::ZoneConfig {
            name: "example.com".to_string(),
            request_xfr_from: vec![
                "192.0.2.1:53".parse().unwrap(),
                "192.0.2.2:53".parse().unwrap(),
            ],
            request_xfr_tsig: None,
            allow_notify_from: Vec::new(),
            provide_xfr_to: Vec::new(),
            do_notify_to: Vec::new(),
        };
        let mut state = ZoneState::new(&config);
        let mut engine = ZoneEngine::new(&mut state);
        assert_eq!(engine.next_master(0), Some(1));
        assert_eq!(engine.next_master(1), Some(0));
        assert_eq!(engine.state.round, 1);
    }
}

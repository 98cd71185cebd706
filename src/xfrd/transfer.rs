//! Pulling one AXFR/IXFR attempt from a single master over TCP.
//!
//! Grounded on `xfrd.c`'s `xfrd_tcp_read` / `xfrd_parse_received_xfr_packet`
//! loop: open one TCP connection, write a framed query, then read framed
//! responses until the closing SOA appears — per RFC 1995/5936, a
//! multi-message AXFR/IXFR ends when an SOA record's serial matches the
//! serial of the very first record in the transfer. Every answer RR is
//! appended to the zone's journal as it's read; non-SOA RRs are rendered
//! using RFC 3597 generic syntax rather than a full per-type presentation
//! encoder (see [`crate::wire::packet::rr_to_master_line`]).

use std::fmt;
use std::net::SocketAddr;

use camino::Utf8Path;
use tokio::net::TcpStream;

use crate::journal::writer::JournalWriter;
use crate::tcpset::{read_framed, write_framed, BoundedPool, TcpError};
use crate::tsig::registry::{Algorithm, Key};
use crate::tsig::rr::{TsigError, TsigRr, TsigStatus};
use crate::wire::buffer::{Buffer, WireError};
use crate::wire::name::Dname;
use crate::wire::packet::{decode_soa_rdata, encode_query, read_rr, rr_to_master_line, SoaRecord, WireRr, OPCODE_QUERY, QCLASS_IN, QTYPE_AXFR, QTYPE_SOA};

/// A fresh, random query id for an outbound transfer request, so a
/// blind off-path responder can't guess it.
pub fn random_query_id() -> u16 {
    rand::random()
}

//----------- AttemptOutcome / TransferError --------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The master reported our serial is already current; nothing was
    /// written to the journal.
    UpToDate,
    /// A full transfer was received and committed to the journal, ending
    /// on this closing SOA.
    Applied { soa: SoaRecord },
}

#[derive(Debug)]
pub enum TransferError {
    Connect(std::io::Error),
    Tcp(TcpError),
    Wire(WireError),
    Tsig(TsigError),
    Journal(std::io::Error),
    /// TSIG verification failed, or too many consecutive responses in
    /// the chain arrived unsigned.
    TsigFailed,
    /// The master doesn't support the requested transfer type.
    NotImplemented,
    /// The master truncated its response; retrying over TCP won't help
    /// since we're already on TCP.
    Truncated,
    Refused { rcode: u8 },
    Protocol(&'static str),
}

impl From<WireError> for TransferError {
    fn from(e: WireError) -> Self {
        TransferError::Wire(e)
    }
}

impl From<TcpError> for TransferError {
    fn from(e: TcpError) -> Self {
        TransferError::Tcp(e)
    }
}

impl From<TsigError> for TransferError {
    fn from(e: TsigError) -> Self {
        TransferError::Tsig(e)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Connect(e) => write!(f, "could not connect to master: {e}"),
            TransferError::Tcp(e) => write!(f, "{e}"),
            TransferError::Wire(e) => write!(f, "malformed transfer response: {e}"),
            TransferError::Tsig(e) => write!(f, "tsig error: {e}"),
            TransferError::Journal(e) => write!(f, "could not write journal: {e}"),
            TransferError::TsigFailed => write!(f, "tsig verification failed"),
            TransferError::NotImplemented => write!(f, "master does not support this transfer type"),
            TransferError::Truncated => write!(f, "master truncated its response"),
            TransferError::Refused { rcode } => write!(f, "master refused the request (rcode {rcode})"),
            TransferError::Protocol(msg) => write!(f, "protocol error: {msg}"),
        }
    }
}

impl std::error::Error for TransferError {}

//----------- run_one_attempt ------------------------------------------------------

/// Run one AXFR/IXFR attempt against `master` and, if a transfer was
/// actually delivered, commit it to `zone`'s journal under `journal_dir`.
/// `pool` bounds how many of these outbound connections run at once
/// across every zone, in FIFO order once full, mirroring the bound kept
/// on the inbound transfer server.
#[allow(clippy::too_many_arguments)]
pub async fn run_one_attempt(
    master: SocketAddr,
    zone_name: &Dname,
    qtype: u16,
    query_id: u16,
    known_serial: Option<u32>,
    tsig: Option<(&Key, Algorithm)>,
    journal_dir: &Utf8Path,
    zone: &str,
    now: u64,
    pool: &BoundedPool<String>,
) -> Result<AttemptOutcome, TransferError> {
    let _permit = pool.acquire(zone.to_string()).await;
    let mut stream = TcpStream::connect(master).await.map_err(TransferError::Connect)?;

    let mut tsig_txn = TsigRr::new();
    let mut query_buf = Buffer::new(512)?;
    encode_query(&mut query_buf, query_id, OPCODE_QUERY, zone_name, qtype, QCLASS_IN)?;

    if let Some((key, algorithm)) = tsig {
        tsig_txn.reset(key.clone(), algorithm);
        tsig_txn.prepare(query_id)?;
        let written = query_buf.position();
        tsig_txn.update(query_buf.written_slice(), written)?;
        let mac = tsig_txn.sign(now, &[])?;
        let key_name = Dname::from_text(&key.name)?;
        let algo_name = Dname::from_text(algorithm.name.wire_name())?;
        tsig_txn.append(&mut query_buf, &key_name, &algo_name, now, &mac, &[])?;
    }

    query_buf.flip();
    write_framed(&mut stream, query_buf.as_slice()).await?;

    let mut writer = JournalWriter::open(journal_dir, zone, qtype == QTYPE_AXFR).map_err(TransferError::Journal)?;
    writer.begin_packet().map_err(TransferError::Journal)?;

    let mut first_soa: Option<SoaRecord> = None;
    let mut total_rr = 0usize;
    let mut message_index = 0u32;

    loop {
        let payload = read_framed(&mut stream).await?;
        let mut buf = Buffer::from_bytes(&payload)?;

        let rcode = buf.rcode()?;
        if rcode == 4 {
            return Err(TransferError::NotImplemented);
        }
        if rcode != 0 {
            return Err(TransferError::Refused { rcode });
        }
        if buf.header_id()? != query_id || !buf.qr()? {
            return Err(TransferError::Protocol("unexpected id or non-response message"));
        }
        if buf.tc()? {
            return Err(TransferError::Truncated);
        }

        let ancount = buf.ancount()?;
        if ancount == 0 {
            return Err(TransferError::Protocol("transfer response carried no answers"));
        }

        buf.set_position(12)?;
        for _ in 0..buf.qdcount()? {
            buf.skip_dname()?;
            buf.skip(4)?;
        }

        if message_index == 0 && ancount == 1 {
            let rr = read_rr(&mut buf.clone())?;
            if rr.rtype == QTYPE_SOA && Some(soa_rdata(&rr)?.serial) == known_serial {
                return Ok(AttemptOutcome::UpToDate);
            }
        }

        let mut done = false;
        for _ in 0..ancount {
            let rr = read_rr(&mut buf)?;
            total_rr += 1;

            if rr.rtype == QTYPE_SOA {
                let soa = soa_rdata(&rr)?;
                if first_soa.is_none() {
                    first_soa = Some(soa);
                } else if total_rr > 1 && soa.serial == first_soa.as_ref().unwrap().serial {
                    done = true;
                }
            }

            writer.append_rr_line(&rr_to_master_line(&rr)).map_err(TransferError::Journal)?;
        }

        for _ in 0..buf.nscount()? {
            buf.skip_rr()?;
        }

        if buf.arcount()? > 0 {
            match TsigRr::find(&mut buf)? {
                Some(found) => {
                    let Some((key, algorithm)) = tsig else {
                        return Err(TransferError::Protocol("unsolicited tsig on an unsigned transfer"));
                    };
                    let signed_prefix = &payload[..found.rr_start];
                    if tsig_txn.verify(signed_prefix, &found, key, algorithm) != TsigStatus::Ok {
                        return Err(TransferError::TsigFailed);
                    }
                }
                None if tsig.is_some() => {
                    if !tsig_txn.record_unsigned() {
                        return Err(TransferError::TsigFailed);
                    }
                }
                None => {}
            }
        } else if tsig.is_some() && !tsig_txn.record_unsigned() {
            return Err(TransferError::TsigFailed);
        }

        if done {
            break;
        }
        message_index += 1;
    }

    writer.end_packet().map_err(TransferError::Journal)?;
    writer.finalize().map_err(TransferError::Journal)?;

    let soa = first_soa.ok_or(TransferError::Protocol("transfer ended without an soa"))?;
    Ok(AttemptOutcome::Applied { soa })
}

fn soa_rdata(rr: &WireRr) -> Result<SoaRecord, TransferError> {
    let mut buf = Buffer::from_bytes(&rr.rdata)?;
    Ok(decode_soa_rdata(&mut buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use crate::tsig::registry::AlgorithmName;
    use crate::wire::packet::SoaRecord;

    fn soa_rr(owner: &Dname, serial: u32) -> WireRr {
        let soa = SoaRecord {
            mname: Dname::from_text("ns1.example.com.").unwrap(),
            rname: Dname::from_text("hostmaster.example.com.").unwrap(),
            serial,
            refresh: 3600,
            retry: 300,
            expire: 604_800,
            minimum: 3600,
        };
        let mut rdata_buf = Buffer::new(512).unwrap();
        soa.encode_rdata(&mut rdata_buf).unwrap();
        let rdata = rdata_buf.as_slice()[..rdata_buf.position()].to_vec();
        WireRr { owner: owner.clone(), rtype: QTYPE_SOA, rclass: QCLASS_IN, ttl: 3600, rdata }
    }

    fn a_rr(owner: &Dname) -> WireRr {
        WireRr { owner: owner.clone(), rtype: 1, rclass: QCLASS_IN, ttl: 3600, rdata: vec![192, 0, 2, 1] }
    }

    fn write_rr(buf: &mut Buffer, rr: &WireRr) {
        buf.write_dname(&rr.owner).unwrap();
        buf.write_u16(rr.rtype).unwrap();
        buf.write_u16(rr.rclass).unwrap();
        buf.write_u32(rr.ttl).unwrap();
        buf.write_u16(rr.rdata.len() as u16).unwrap();
        buf.write_bytes(&rr.rdata).unwrap();
    }

    /// Read the client's framed query off `stream`.
    async fn read_query(stream: &mut tokio::net::TcpStream) -> Vec<u8> {
        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await.unwrap();
        let len = u16::from_be_bytes(len_buf) as usize;
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.unwrap();
        body
    }

    async fn send_framed(stream: &mut tokio::net::TcpStream, payload: &[u8]) {
        stream.write_all(&(payload.len() as u16).to_be_bytes()).await.unwrap();
        stream.write_all(payload).await.unwrap();
    }

    #[tokio::test]
    async fn reports_up_to_date_without_touching_the_journal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_query(&mut stream).await;

            let mut resp = Buffer::new(512).unwrap();
            encode_query(&mut resp, 0xaaaa, OPCODE_QUERY, &zone_name, QTYPE_AXFR, QCLASS_IN).unwrap();
            resp.set_qr(true).unwrap();
            resp.set_ancount(1).unwrap();
            write_rr(&mut resp, &soa_rr(&zone_name, 42));
            resp.flip();
            send_framed(&mut stream, resp.as_slice()).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();

        let pool = BoundedPool::new();
        let outcome = run_one_attempt(
            addr,
            &zone_name,
            QTYPE_AXFR,
            0xaaaa,
            Some(42),
            None,
            dir,
            "example.com",
            1_000_000,
            &pool,
        )
        .await
        .unwrap();

        assert_eq!(outcome, AttemptOutcome::UpToDate);
        assert!(!dir.join("example.com.xfrd").exists());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn commits_a_full_axfr_to_the_journal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_query(&mut stream).await;

            let mut resp = Buffer::new(512).unwrap();
            encode_query(&mut resp, 0xbbbb, OPCODE_QUERY, &zone_name, QTYPE_AXFR, QCLASS_IN).unwrap();
            resp.set_qr(true).unwrap();
            resp.set_ancount(3).unwrap();
            write_rr(&mut resp, &soa_rr(&zone_name, 43));
            write_rr(&mut resp, &a_rr(&zone_name));
            write_rr(&mut resp, &soa_rr(&zone_name, 43));
            resp.flip();
            send_framed(&mut stream, resp.as_slice()).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();

        let pool = BoundedPool::new();
        let outcome = run_one_attempt(
            addr,
            &zone_name,
            QTYPE_AXFR,
            0xbbbb,
            Some(10),
            None,
            dir,
            "example.com",
            1_000_000,
            &pool,
        )
        .await
        .unwrap();

        match outcome {
            AttemptOutcome::Applied { soa } => {
                assert_eq!(soa.serial, 43);
                assert_eq!(soa.refresh, 3600);
                assert_eq!(soa.retry, 300);
                assert_eq!(soa.expire, 604_800);
                assert_eq!(soa.minimum, 3600);
            }
            other => panic!("expected Applied, got {other:?}"),
        }
        let contents = std::fs::read_to_string(dir.join("example.com.xfrd")).unwrap();
        assert!(contents.contains("SOA ns1.example.com. hostmaster.example.com. 43"));
        assert!(contents.contains("TYPE1 \\# 4 c0000201"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn verifies_a_tsig_signed_response_chain() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();
        let key = Key { name: "xfr-key.".into(), secret: b"0123456789abcdef".to_vec(), algorithm: AlgorithmName::HmacSha256 };
        let algorithm = Algorithm::new(AlgorithmName::HmacSha256);

        let server_key = key.clone();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let query_payload = read_query(&mut stream).await;

            // Locate the client's own TSIG RR (the chain's first
            // signature) so the server can replay the same digest and
            // land in the same chained state the client is in, rather
            // than fabricating an unrelated prior MAC.
            let mut qbuf = Buffer::from_bytes(&query_payload).unwrap();
            qbuf.set_position(12).unwrap();
            for _ in 0..qbuf.qdcount().unwrap() {
                qbuf.skip_dname().unwrap();
                qbuf.skip(4).unwrap();
            }
            let found_in_query = TsigRr::find(&mut qbuf).unwrap().unwrap();

            let mut signer = TsigRr::new();
            signer.reset(server_key.clone(), algorithm);
            signer.prepare(found_in_query.original_id).unwrap();
            signer.update(&query_payload, found_in_query.rr_start).unwrap();
            signer.sign(found_in_query.signed_time, &found_in_query.other_data).unwrap();

            let mut resp = Buffer::new(512).unwrap();
            encode_query(&mut resp, 0xcccc, OPCODE_QUERY, &zone_name, QTYPE_AXFR, QCLASS_IN).unwrap();
            resp.set_qr(true).unwrap();
            resp.set_ancount(2).unwrap();
            write_rr(&mut resp, &soa_rr(&zone_name, 44));
            write_rr(&mut resp, &soa_rr(&zone_name, 44));

            signer.prepare(0xcccc).unwrap();
            let written = resp.position();
            signer.update(resp.written_slice(), written).unwrap();
            let mac = signer.sign(1_000_000, &[]).unwrap();
            let key_name = Dname::from_text(&server_key.name).unwrap();
            let algo_name = Dname::from_text(algorithm.name.wire_name()).unwrap();
            signer.append(&mut resp, &key_name, &algo_name, 1_000_000, &mac, &[]).unwrap();

            resp.flip();
            send_framed(&mut stream, resp.as_slice()).await;
        });

        let dir = tempfile::tempdir().unwrap();
        let dir = camino::Utf8Path::from_path(dir.path()).unwrap();
        let zone_name = Dname::from_text("example.com.").unwrap();

        let pool = BoundedPool::new();
        let outcome = run_one_attempt(
            addr,
            &zone_name,
            QTYPE_AXFR,
            0xcccc,
            Some(10),
            Some((&key, algorithm)),
            dir,
            "example.com",
            1_000_000,
            &pool,
        )
        .await
        .unwrap();

        match outcome {
            AttemptOutcome::Applied { soa } => assert_eq!(soa.serial, 44),
            other => panic!("expected Applied, got {other:?}"),
        }
        server.await.unwrap();
    }
}

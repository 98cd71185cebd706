//! The per-transaction TSIG RR: the digest state, prior-MAC chaining, and
//! the wire encode/decode of the TSIG resource record itself.

use crate::wire::buffer::{Buffer, WireError};
use crate::wire::name::Dname;

use super::registry::{Algorithm, AlgorithmName, HmacContext, Key, TsigRegistry};

pub const RR_TYPE_TSIG: u16 = 250;
pub const CLASS_ANY: u16 = 255;

pub const ERROR_BADSIG: u16 = 16;
pub const ERROR_BADKEY: u16 = 17;
pub const ERROR_BADTIME: u16 = 18;

pub const DEFAULT_FUDGE: u16 = 300;

/// How many consecutive unsigned responses are tolerated within one
/// multi-packet chain once the first response has carried a valid TSIG.
pub const MAX_UNSIGNED_IN_CHAIN: u32 = 100;

//----------- TsigStatus ----------------------------------------------------------

/// The outcome of verifying (or failing to find) a TSIG on an inbound
/// message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TsigStatus {
    /// The message carried no TSIG RR at all.
    NotPresent,
    /// Verified successfully.
    Ok,
    /// Present but rejected, with the RFC 8945 error sub-code
    /// (`BADSIG`/`BADKEY`/`BADTIME`, or a DNS RCODE below 16).
    Error(u16),
}

//----------- TsigError ----------------------------------------------------------

#[derive(Debug)]
pub enum TsigError {
    Wire(WireError),
    UnknownKey,
    UnknownAlgorithm,
    NotYetPrepared,
}

impl From<WireError> for TsigError {
    fn from(e: WireError) -> Self {
        TsigError::Wire(e)
    }
}

impl std::fmt::Display for TsigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TsigError::Wire(e) => write!(f, "tsig wire error: {e}"),
            TsigError::UnknownKey => write!(f, "tsig key not found"),
            TsigError::UnknownAlgorithm => write!(f, "tsig algorithm not found"),
            TsigError::NotYetPrepared => write!(f, "tsig transaction was not prepared"),
        }
    }
}

impl std::error::Error for TsigError {}

//----------- FoundTsig ------------------------------------------------------------

/// What [`TsigRr::find`] extracts from a trailing TSIG RR, before it has
/// been cross-referenced against the registry.
#[derive(Clone, Debug)]
pub struct FoundTsig {
    pub key_name: Dname,
    pub algorithm_name: Dname,
    pub signed_time: u64,
    pub fudge: u16,
    pub mac: Vec<u8>,
    pub original_id: u16,
    pub error: u16,
    pub other_data: Vec<u8>,
    /// Offset in the message at which the TSIG RR itself begins; bytes
    /// before this offset (with the id substituted) are what was signed.
    pub rr_start: usize,
}

//----------- TsigRr -------------------------------------------------------------

/// A TSIG transaction: created once per connection (or per UDP exchange),
/// `reset` at the start of each exchange, and threaded through
/// `prepare` → `update`* → `sign`/`verify` → `append`.
pub struct TsigRr {
    key: Option<Key>,
    algorithm: Option<Algorithm>,
    context: Option<HmacContext>,
    prior_mac: Vec<u8>,
    original_query_id: u16,
    fudge: u16,
    error: u16,
    /// How many signatures have been produced/consumed in this chain.
    /// Beyond the second, only the "timers only" variables block is
    /// digested.
    response_count: u32,
    /// Consecutive unsigned responses since the last verified one, used
    /// to enforce [`MAX_UNSIGNED_IN_CHAIN`].
    unsigned_run: u32,
}

impl Default for TsigRr {
    fn default() -> Self {
        Self::new()
    }
}

impl TsigRr {
    pub fn new() -> Self {
        Self {
            key: None,
            algorithm: None,
            context: None,
            prior_mac: Vec::new(),
            original_query_id: 0,
            fudge: DEFAULT_FUDGE,
            error: 0,
            response_count: 0,
            unsigned_run: 0,
        }
    }

    /// Reset the transaction state for a fresh exchange with the given
    /// key and algorithm.
    pub fn reset(&mut self, key: Key, algorithm: Algorithm) {
        self.key = Some(key);
        self.algorithm = Some(algorithm);
        self.context = None;
        self.prior_mac.clear();
        self.original_query_id = 0;
        self.fudge = DEFAULT_FUDGE;
        self.error = 0;
        self.response_count = 0;
        self.unsigned_run = 0;
    }

    pub fn response_count(&self) -> u32 {
        self.response_count
    }

    /// Start a new digest, seeding it with the prior MAC (length-prefixed)
    /// when this isn't the chain's first signature.
    pub fn prepare(&mut self, original_query_id: u16) -> Result<(), TsigError> {
        let algorithm = self.algorithm.ok_or(TsigError::NotYetPrepared)?;
        let key = self.key.as_ref().ok_or(TsigError::NotYetPrepared)?;
        let mut ctx = algorithm.context(&key.secret);

        if self.response_count > 0 {
            ctx.update(&(self.prior_mac.len() as u16).to_be_bytes());
            ctx.update(&self.prior_mac);
        }

        self.context = Some(ctx);
        self.original_query_id = original_query_id;
        Ok(())
    }

    /// Feed the first `n` octets of `wire` into the digest, with the
    /// header's id field temporarily replaced by `original_query_id`.
    pub fn update(&mut self, wire: &[u8], n: usize) -> Result<(), TsigError> {
        let ctx = self.context.as_mut().ok_or(TsigError::NotYetPrepared)?;
        let mut patched = wire[..n].to_vec();
        if patched.len() >= 2 {
            patched[0..2].copy_from_slice(&self.original_query_id.to_be_bytes());
        }
        ctx.update(&patched);
        Ok(())
    }

    /// Finalise the digest over the variables block and store the result
    /// as the new prior MAC. Beyond the second signature in a chain, only
    /// the time fields are digested ("timers only" elision).
    pub fn sign(&mut self, signed_time: u64, other_data: &[u8]) -> Result<Vec<u8>, TsigError> {
        let algorithm = self.algorithm.ok_or(TsigError::NotYetPrepared)?;
        let key = self.key.as_ref().ok_or(TsigError::NotYetPrepared)?;
        let mut ctx = self.context.take().ok_or(TsigError::NotYetPrepared)?;

        if self.response_count < 2 {
            digest_full_variables(
                &mut ctx,
                &key.name,
                algorithm.name,
                signed_time,
                self.fudge,
                self.error,
                other_data,
            );
        } else {
            digest_timers_only(&mut ctx, signed_time, self.fudge);
        }

        let mac = ctx.sign();
        self.prior_mac = mac.clone();
        self.response_count += 1;
        Ok(mac)
    }

    /// Write the TSIG RR into `buf` and bump `ARCOUNT`.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        buf: &mut Buffer,
        key_name: &Dname,
        algorithm_name: &Dname,
        signed_time: u64,
        mac: &[u8],
        other_data: &[u8],
    ) -> Result<(), TsigError> {
        buf.write_dname(key_name)?;
        buf.write_u16(RR_TYPE_TSIG)?;
        buf.write_u16(CLASS_ANY)?;
        buf.write_u32(0)?; // ttl

        let rdlength_pos = buf.position();
        buf.write_u16(0)?;
        let rdata_start = buf.position();

        buf.write_dname(algorithm_name)?;
        buf.write_u16(((signed_time >> 32) & 0xffff) as u16)?;
        buf.write_u32((signed_time & 0xffff_ffff) as u32)?;
        buf.write_u16(self.fudge)?;
        buf.write_u16(mac.len() as u16)?;
        buf.write_bytes(mac)?;
        buf.write_u16(self.original_query_id)?;
        buf.write_u16(self.error)?;
        buf.write_u16(other_data.len() as u16)?;
        buf.write_bytes(other_data)?;

        let rdlength = (buf.position() - rdata_start) as u16;
        buf.write_u16_at(rdlength_pos, rdlength)?;
        buf.incr_arcount()?;
        Ok(())
    }

    /// Locate a TSIG RR at the buffer's current position (the caller has
    /// already walked past the question/answer/authority sections and
    /// `ARCOUNT - 1` other additional records), parse it, and leave the
    /// buffer's position just past it.
    pub fn find(buf: &mut Buffer) -> Result<Option<FoundTsig>, TsigError> {
        let rr_start = buf.position();
        let key_name = buf.read_dname()?;
        let rtype = buf.read_u16()?;
        let _class = buf.read_u16()?;
        let _ttl = buf.read_u32()?;
        let _rdlength = buf.read_u16()?;

        if rtype != RR_TYPE_TSIG {
            buf.set_position(rr_start)?;
            return Ok(None);
        }

        let algorithm_name = buf.read_dname()?;
        let hi = buf.read_u16()? as u64;
        let lo = buf.read_u32()? as u64;
        let signed_time = (hi << 32) | lo;
        let fudge = buf.read_u16()?;
        let mac_len = buf.read_u16()? as usize;
        let mac = buf.read_bytes(mac_len)?.to_vec();
        let original_id = buf.read_u16()?;
        let error = buf.read_u16()?;
        let other_len = buf.read_u16()? as usize;
        let other_data = buf.read_bytes(other_len)?.to_vec();

        Ok(Some(FoundTsig {
            key_name,
            algorithm_name,
            signed_time,
            fudge,
            mac,
            original_id,
            error,
            other_data,
            rr_start,
        }))
    }

    /// Cross-reference a found TSIG against the registry and check the
    /// signed-time window. Returns the resolved key/algorithm on success.
    pub fn lookup(
        found: &FoundTsig,
        registry: &TsigRegistry,
        now: u64,
    ) -> Result<(Key, Algorithm), TsigStatus> {
        let algorithm = registry
            .algo_lookup(&found.algorithm_name.to_text())
            .ok_or(TsigStatus::Error(ERROR_BADKEY))?;

        let key = registry
            .key_lookup(&found.key_name.to_text(), algorithm.name)
            .cloned()
            .ok_or(TsigStatus::Error(ERROR_BADKEY))?;

        let window = found.fudge as i64;
        let delta = (now as i64) - (found.signed_time as i64);
        if delta.abs() > window {
            return Err(TsigStatus::Error(ERROR_BADTIME));
        }

        Ok((key, algorithm))
    }

    /// Recompute the HMAC over `signed_prefix` (the wire bytes up to but
    /// excluding the TSIG RR, with the id already substituted by the
    /// caller) plus the variables block, and compare against the MAC the
    /// peer sent.
    pub fn verify(
        &mut self,
        signed_prefix: &[u8],
        found: &FoundTsig,
        key: &Key,
        algorithm: Algorithm,
    ) -> TsigStatus {
        self.key = Some(key.clone());
        self.algorithm = Some(algorithm);

        if self.prepare(found.original_id).is_err() {
            return TsigStatus::Error(ERROR_BADKEY);
        }
        if self.update(signed_prefix, signed_prefix.len()).is_err() {
            return TsigStatus::Error(ERROR_BADSIG);
        }

        self.error = found.error;
        let expected = match self.sign(found.signed_time, &found.other_data) {
            Ok(mac) => mac,
            Err(_) => return TsigStatus::Error(ERROR_BADSIG),
        };

        if constant_time_eq(&expected, &found.mac) {
            self.unsigned_run = 0;
            TsigStatus::Ok
        } else {
            TsigStatus::Error(ERROR_BADSIG)
        }
    }

    /// Record that a response in this chain arrived without a TSIG.
    /// Returns `false` once the tolerance is exhausted, at which point
    /// the caller must treat the chain as broken.
    pub fn record_unsigned(&mut self) -> bool {
        self.unsigned_run += 1;
        self.unsigned_run <= MAX_UNSIGNED_IN_CHAIN
    }
}

fn digest_full_variables(
    ctx: &mut HmacContext,
    key_name: &str,
    algorithm: AlgorithmName,
    signed_time: u64,
    fudge: u16,
    error: u16,
    other_data: &[u8],
) {
    let name = Dname::from_text(key_name).unwrap_or_else(|_| Dname::root());
    ctx.update(name.as_wire());
    ctx.update(&(CLASS_ANY).to_be_bytes());
    ctx.update(&0u32.to_be_bytes()); // ttl
    let algo_name = Dname::from_text(algorithm.wire_name()).unwrap_or_else(|_| Dname::root());
    ctx.update(algo_name.as_wire());
    digest_timers_only(ctx, signed_time, fudge);
    ctx.update(&error.to_be_bytes());
    ctx.update(&(other_data.len() as u16).to_be_bytes());
    ctx.update(other_data);
}

fn digest_timers_only(ctx: &mut HmacContext, signed_time: u64, fudge: u16) {
    ctx.update(&(((signed_time >> 32) & 0xffff) as u16).to_be_bytes());
    ctx.update(&((signed_time & 0xffff_ffff) as u32).to_be_bytes());
    ctx.update(&fudge.to_be_bytes());
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tsig::registry::AlgorithmName;

    fn test_key() -> Key {
        Key {
            name: "example-key.".into(),
            secret: b"0123456789abcdef".to_vec(),
            algorithm: AlgorithmName::HmacSha256,
        }
    }

    #[test]
    fn sign_then_verify_over_identical_wire_is_ok() {
        let key = test_key();
        let algorithm = Algorithm::new(AlgorithmName::HmacSha256);
        let wire = b"pretend-dns-message-bytes";

        let mut signer = TsigRr::new();
        signer.reset(key.clone(), algorithm);
        signer.prepare(0x1234).unwrap();
        signer.update(wire, wire.len()).unwrap();
        let mac = signer.sign(1_000_000, &[]).unwrap();

        let found = FoundTsig {
            key_name: Dname::from_text(&key.name).unwrap(),
            algorithm_name: Dname::from_text(algorithm.name.wire_name()).unwrap(),
            signed_time: 1_000_000,
            fudge: DEFAULT_FUDGE,
            mac: mac.clone(),
            original_id: 0x1234,
            error: 0,
            other_data: vec![],
            rr_start: wire.len(),
        };

        let mut verifier = TsigRr::new();
        let status = verifier.verify(wire, &found, &key, algorithm);
        assert_eq!(status, TsigStatus::Ok);
    }

    #[test]
    fn flipping_a_mac_bit_produces_badsig() {
        let key = test_key();
        let algorithm = Algorithm::new(AlgorithmName::HmacSha256);
        let wire = b"pretend-dns-message-bytes";

        let mut signer = TsigRr::new();
        signer.reset(key.clone(), algorithm);
        signer.prepare(1).unwrap();
        signer.update(wire, wire.len()).unwrap();
        let mut mac = signer.sign(1_000_000, &[]).unwrap();
        mac[0] ^= 0x01;

        let found = FoundTsig {
            key_name: Dname::from_text(&key.name).unwrap(),
            algorithm_name: Dname::from_text(algorithm.name.wire_name()).unwrap(),
            signed_time: 1_000_000,
            fudge: DEFAULT_FUDGE,
            mac,
            original_id: 1,
            error: 0,
            other_data: vec![],
            rr_start: wire.len(),
        };

        let mut verifier = TsigRr::new();
        let status = verifier.verify(wire, &found, &key, algorithm);
        assert_eq!(status, TsigStatus::Error(ERROR_BADSIG));
    }

    #[test]
    fn signed_time_outside_fudge_is_badtime() {
        let found = FoundTsig {
            key_name: Dname::from_text("example-key.").unwrap(),
            algorithm_name: Dname::from_text("hmac-sha256.").unwrap(),
            signed_time: 1_000_000,
            fudge: 300,
            mac: vec![],
            original_id: 1,
            error: 0,
            other_data: vec![],
            rr_start: 0,
        };
        let mut registry = TsigRegistry::new();
        registry.register(test_key());

        // Exactly fudge seconds off: accepted.
        assert!(TsigRr::lookup(&found, &registry, 1_000_300).is_ok());
        // One second further: rejected.
        assert_eq!(
            TsigRr::lookup(&found, &registry, 1_000_301).unwrap_err(),
            TsigStatus::Error(ERROR_BADTIME)
        );
    }

    #[test]
    fn third_signature_in_a_chain_digests_timers_only() {
        let key = test_key();
        let algorithm = Algorithm::new(AlgorithmName::HmacSha256);
        let mut signer = TsigRr::new();
        signer.reset(key, algorithm);

        signer.prepare(1).unwrap();
        signer.update(b"packet-1", 8).unwrap();
        signer.sign(1000, &[]).unwrap();
        assert_eq!(signer.response_count(), 1);

        signer.prepare(1).unwrap();
        signer.update(b"packet-2", 8).unwrap();
        signer.sign(1001, &[]).unwrap();
        assert_eq!(signer.response_count(), 2);

        // The third signature takes the "timers only" branch; this just
        // checks it doesn't panic and still advances the counter.
        signer.prepare(1).unwrap();
        signer.update(b"packet-3", 8).unwrap();
        signer.sign(1002, &[]).unwrap();
        assert_eq!(signer.response_count(), 3);
    }
}

//! Per-zone transfer state: cached SOA, serial bookkeeping across the
//! three places a serial can come from (a completed transfer, the zone on
//! disk, and an unsolicited NOTIFY), and the refresh/retry/expire timer
//! state machine.
//!
//! A zone is always in exactly one timer state, and the state carries only
//! the data relevant to it rather than a single struct with a cloud of
//! `Option` fields.

use std::net::SocketAddr;
use std::time::Duration;

use crate::config::ZoneConfig;
use crate::wire::packet::SoaRecord;

/// Every master is retried at most this many times within one refresh
/// round before the zone is declared unreachable for the round.
pub const XFRD_MAX_ROUNDS: u32 = 3;

/// A master that answered IXFR with "no, you're too far behind" is not
/// asked again for this long.
pub const XFRD_NO_IXFR_CACHE: Duration = Duration::from_secs(172_800);

pub const DEFAULT_REFRESH: u32 = 3600;
pub const DEFAULT_RETRY: u32 = 300;
pub const DEFAULT_EXPIRE: u32 = 604_800;
pub const DEFAULT_MINIMUM: u32 = 3600;

pub const UDP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// The zone's place in its refresh/retry/expire lifecycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshTimerState {
    /// No transfer in flight; next action is due at `deadline`
    /// (`now + refresh`, or `now + retry` after a failed round).
    Waiting { deadline: u64 },
    /// A probe or transfer is in flight against `master` (index into
    /// [`ZoneState::masters`]), `attempt` rounds into this master.
    Transferring { master_index: usize, attempt: u32 },
    /// Every master failed this round; waiting `retry` seconds before
    /// trying the whole master list again, unless `expire` fires first.
    RetryBackoff { deadline: u64 },
    /// The zone's SOA expire interval elapsed with no successful
    /// transfer; service of the zone should stop until one succeeds.
    Expired,
}

/// Where a zone's currently-known serial came from, for reporting
/// purposes ([`crate::xfrd::engine::StatusSnapshot`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SerialSource {
    Disk,
    Notify,
    Xfr,
}

pub struct ZoneState {
    pub name: String,
    pub masters: Vec<SocketAddr>,
    pub tsig_key_name: Option<String>,

    /// The SOA last written to disk (via the journal), if any.
    pub soa_disk: Option<SoaRecord>,
    /// The serial carried by the most recent unsolicited NOTIFY, if it
    /// hasn't yet been superseded by a completed transfer.
    pub serial_notify: Option<u32>,
    /// The serial of the transfer currently (or most recently)
    /// in flight.
    pub serial_xfr: Option<u32>,
    pub serial_source: SerialSource,

    pub timer: RefreshTimerState,
    pub round: u32,
    /// IXFR negative-cache entries: `(master_index, blocked_until_secs)`.
    negative_ixfr_cache: Vec<(usize, u32, u64)>,

    pub reactor_handler: Option<crate::netio::HandlerId>,
}

impl ZoneState {
    pub fn new(config: &ZoneConfig) -> Self {
        Self {
            name: config.name.clone(),
            masters: config.request_xfr_from.clone(),
            tsig_key_name: config.request_xfr_tsig.clone(),
            soa_disk: None,
            serial_notify: None,
            serial_xfr: None,
            serial_source: SerialSource::Disk,
            timer: RefreshTimerState::Waiting { deadline: 0 },
            round: 0,
            negative_ixfr_cache: Vec::new(),
            reactor_handler: None,
        }
    }

    pub fn current_serial(&self) -> Option<u32> {
        self.soa_disk.as_ref().map(|soa| soa.serial)
    }

    /// Record an unsolicited NOTIFY carrying `serial` (or no SOA, in
    /// which case a probe is still warranted). Returns `true` if this
    /// should trigger an immediate refresh.
    pub fn record_notify(&mut self, serial: Option<u32>, now: u64) -> bool {
        let should_refresh = match (serial, self.current_serial()) {
            (Some(new), Some(current)) => crate::journal::reader::dns_serial_gt(new, current),
            (Some(_), None) => true,
            (None, _) => true,
        };
        if should_refresh {
            self.serial_notify = serial;
            self.timer = RefreshTimerState::Waiting { deadline: now };
        }
        should_refresh
    }

    pub fn refresh_after(&mut self, soa: &SoaRecord, now: u64) {
        self.soa_disk = Some(soa.clone());
        self.serial_source = SerialSource::Xfr;
        self.serial_notify = None;
        self.round = 0;
        self.timer = RefreshTimerState::Waiting {
            deadline: now + soa.refresh as u64,
        };
    }

    pub fn enter_retry_backoff(&mut self, now: u64) {
        let retry = self
            .soa_disk
            .as_ref()
            .map(|s| s.retry)
            .unwrap_or(DEFAULT_RETRY) as u64;
        self.timer = RefreshTimerState::RetryBackoff {
            deadline: now + retry,
        };
    }

    pub fn expire_deadline(&self, acquired_at: u64) -> u64 {
        let expire = self
            .soa_disk
            .as_ref()
            .map(|s| s.expire)
            .unwrap_or(DEFAULT_EXPIRE) as u64;
        acquired_at + expire
    }

    pub fn mark_expired(&mut self) {
        self.timer = RefreshTimerState::Expired;
    }

    pub fn note_ixfr_refused(&mut self, master_index: usize, serial: u32, now: u64) {
        self.negative_ixfr_cache.retain(|(idx, _, _)| *idx != master_index);
        self.negative_ixfr_cache
            .push((master_index, serial, now + XFRD_NO_IXFR_CACHE.as_secs()));
    }

    /// `true` if `master_index` recently told us IXFR from `serial` isn't
    /// possible and the negative-cache window hasn't elapsed, meaning we
    /// should go straight to AXFR against that master.
    pub fn ixfr_is_cached_refused(&self, master_index: usize, serial: u32, now: u64) -> bool {
        self.negative_ixfr_cache
            .iter()
            .any(|(idx, cached_serial, until)| {
                *idx == master_index && *cached_serial == serial && now < *until
            })
    }
}

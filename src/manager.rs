//! Wires every subsystem together: per-zone xfrd refresh timers driven
//! through the reactor, the NOTIFY sender's UDP I/O, the outbound
//! AXFR/IXFR TCP listeners, and the control socket.
//!
//! One long-lived task per subsystem, reached through state shared behind
//! an `Arc`, started from a single entry point. There is no readiness
//! handshake between tasks — nothing here depends on another subsystem
//! having already bound a socket before it can start.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use camino::Utf8PathBuf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::acl::AclChain;
use crate::clock::{system_clock, SharedClock, Clock};
use crate::config::{resolve_acl_tsig_algorithms, Config, TsigKeyConfig, ZoneConfig};
use crate::control::{ControlCommand, ControlRequest, ControlResponse, ControlServer};
use crate::error::FatalError;
use crate::metrics::MetricsCollection;
use crate::netio::{HandlerAction, Reactor, ReactorHandle};
use crate::notify::{NotifyOutcome, NotifySender, NOTIFY_MAX_RETRY, ZoneNotifyJob};
use crate::server::content::ZoneContent;
use crate::server::{self, RequestDecision};
use crate::tcpset::{read_framed, write_framed, BoundedPool};
use crate::tsig::registry::TsigRegistry;
use crate::wire::buffer::{Buffer, WireError};
use crate::wire::name::Dname;
use crate::wire::packet::{encode_notify, encode_query, is_notify_reply, OPCODE_NOTIFY, QCLASS_IN, QTYPE_AXFR, QTYPE_IXFR};
use crate::xfrd::{run_one_attempt, AttemptOutcome, RefreshTimerState, TransferError, ZoneEngine, ZoneState};

fn zone_dname(name: &str) -> Result<Dname, WireError> {
    Dname::from_text(name)
}

/// Everything the manager tracks for one configured zone, beyond the
/// transfer-timer bookkeeping already owned by [`ZoneState`].
struct ZoneEntry {
    state: ZoneState,
    notify_acl: AclChain,
    provide_acl: AclChain,
    do_notify_to: Vec<SocketAddr>,
    /// When the zone's content was last refreshed by a completed
    /// transfer, used to compute the SOA `expire` deadline.
    last_success_at: Option<u64>,
    content: Option<Arc<ZoneContent>>,
}

type SharedZones = Arc<Mutex<HashMap<String, ZoneEntry>>>;

/// The NOTIFY sender's socket, its pure state machine, and the mapping
/// from outstanding query id to the campaign it belongs to, so an
/// incoming reply can be routed back to [`NotifySender::record_ack`].
struct NotifyIo {
    socket: UdpSocket,
    sender: Mutex<NotifySender>,
    pending_ids: Mutex<HashMap<u16, (String, SocketAddr)>>,
}

/// Everything one zone's refresh attempt needs, shared behind an `Arc` so
/// the reactor's no-argument callbacks can capture it by clone.
struct RefreshCtx {
    zone: String,
    zones: SharedZones,
    registry: Arc<TsigRegistry>,
    journal_dir: Utf8PathBuf,
    clock: SharedClock,
    reactor: ReactorHandle,
    metrics: Arc<MetricsCollection>,
    notify_io: Arc<NotifyIo>,
    connect_pool: Arc<BoundedPool<String>>,
}

/// Run the daemon: build every zone's state from `config`, start the
/// reactor, the NOTIFY I/O loop, the outbound transfer listeners, and the
/// control socket, then serve control requests until the process is
/// killed.
pub async fn run(config: Config) -> Result<(), FatalError> {
    let registry = Arc::new(
        TsigRegistry::from_config(&config.tsig_keys)
            .map_err(|e| FatalError::with_source("invalid tsig key configuration", e))?,
    );
    let metrics = Arc::new(MetricsCollection::new());
    metrics.set_zones_configured(config.zones.len() as i64);
    let clock = system_clock();
    let journal_dir = config.journal_dir.clone();

    let tsig_keys_by_name = config.tsig_key_by_name();
    let mut zones = HashMap::new();
    for zone_config in &config.zones {
        let entry = build_zone_entry(zone_config, &journal_dir, &tsig_keys_by_name)?;
        zones.insert(zone_config.name.clone(), entry);
    }
    let zones: SharedZones = Arc::new(Mutex::new(zones));

    let reactor = Reactor::new();
    let reactor_handle = reactor.handle();
    tokio::spawn(reactor.run());

    let notify_socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| FatalError::with_source("could not bind notify socket", e))?;
    let notify_io = Arc::new(NotifyIo {
        socket: notify_socket,
        sender: Mutex::new(NotifySender::new()),
        pending_ids: Mutex::new(HashMap::new()),
    });
    tokio::spawn(run_notify_loop(notify_io.clone(), zones.clone(), clock.clone(), metrics.clone()));

    let connect_pool: Arc<BoundedPool<String>> = Arc::new(BoundedPool::new());
    let accept_pool: Arc<BoundedPool<SocketAddr>> = Arc::new(BoundedPool::new());

    for &addr in &config.listen.addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                tracing::info!(target: "server", %addr, "outbound transfer server listening");
                tokio::spawn(run_inbound_listener(
                    listener,
                    zones.clone(),
                    registry.clone(),
                    clock.clone(),
                    metrics.clone(),
                    accept_pool.clone(),
                ));
            }
            Err(e) => tracing::warn!(target: "server", %addr, error = %e, "could not bind outbound transfer listener"),
        }
        match UdpSocket::bind(addr).await {
            Ok(socket) => {
                tokio::spawn(run_inbound_notify_listener(
                    socket,
                    zones.clone(),
                    registry.clone(),
                    journal_dir.clone(),
                    clock.clone(),
                    reactor_handle.clone(),
                    metrics.clone(),
                    notify_io.clone(),
                    connect_pool.clone(),
                ));
            }
            Err(e) => tracing::warn!(target: "notify", %addr, error = %e, "could not bind inbound notify listener"),
        }
    }

    let (control_tx, control_rx) = mpsc::unbounded_channel::<ControlRequest>();
    let control_server = ControlServer::bind(&config.control_socket, control_tx)
        .map_err(|e| FatalError::with_source("could not bind control socket", e))?;
    tokio::spawn(control_server.run());

    let zone_names: Vec<String> = zones.lock().unwrap().keys().cloned().collect();
    for zone in zone_names {
        let ctx = Arc::new(RefreshCtx {
            zone,
            zones: zones.clone(),
            registry: registry.clone(),
            journal_dir: journal_dir.clone(),
            clock: clock.clone(),
            reactor: reactor_handle.clone(),
            metrics: metrics.clone(),
            notify_io: notify_io.clone(),
            connect_pool: connect_pool.clone(),
        });
        schedule_refresh(ctx, Instant::now()).await;
    }

    run_control_loop(
        control_rx,
        zones,
        registry,
        journal_dir,
        clock,
        reactor_handle,
        metrics,
        notify_io,
        connect_pool,
    )
    .await;

    Ok(())
}

fn build_zone_entry(
    config: &ZoneConfig,
    journal_dir: &Utf8PathBuf,
    tsig_keys_by_name: &HashMap<String, &TsigKeyConfig>,
) -> Result<ZoneEntry, FatalError> {
    let mut allow_notify_from = config.allow_notify_from.clone();
    let mut provide_xfr_to = config.provide_xfr_to.clone();
    resolve_acl_tsig_algorithms(&mut allow_notify_from, tsig_keys_by_name);
    resolve_acl_tsig_algorithms(&mut provide_xfr_to, tsig_keys_by_name);

    for acl in allow_notify_from.iter().chain(provide_xfr_to.iter()) {
        if let Some(key_name) = &acl.entry.tsig_key_name {
            if !tsig_keys_by_name.contains_key(&key_name.to_ascii_lowercase()) {
                return Err(FatalError::new(format!(
                    "zone {:?} references unknown tsig key {key_name:?}",
                    config.name
                )));
            }
        }
    }

    let notify_acl = AclChain::new(allow_notify_from.into_iter().map(|a| a.entry).collect());
    let provide_acl = AclChain::new(provide_xfr_to.into_iter().map(|a| a.entry).collect());

    let zone_name = zone_dname(&config.name)
        .map_err(|e| FatalError::with_source(format!("invalid zone name {:?}", config.name), e))?;

    let content = ZoneContent::from_journal(journal_dir, &config.name, &zone_name)
        .map_err(|e| FatalError::with_source(format!("could not read journal for {}", config.name), e))?
        .map(Arc::new);

    let mut state = ZoneState::new(config);
    let mut last_success_at = None;
    if let Some(content) = &content {
        state.soa_disk = Some(content.soa.clone());
        last_success_at = Some(0);
    }

    Ok(ZoneEntry {
        state,
        notify_acl,
        provide_acl,
        do_notify_to: config.do_notify_to.clone(),
        last_success_at,
        content,
    })
}

//----------- xfrd refresh timers, driven through the reactor --------------------

/// Register (or re-register) `ctx.zone`'s next reactor callback at
/// `deadline`. The callback only spawns the actual attempt and cancels
/// itself immediately; the spawned task re-registers the next deadline
/// once it knows the outcome, so a slow transfer never blocks the
/// reactor's dispatch loop for every other zone.
async fn schedule_refresh(ctx: Arc<RefreshCtx>, deadline: Instant) {
    let handler_ctx = ctx.clone();
    let id = ctx
        .reactor
        .register(deadline, move || {
            let ctx = handler_ctx.clone();
            Box::pin(async move {
                tokio::spawn(run_refresh_attempt(ctx));
                HandlerAction::Cancel
            })
        })
        .await;

    if let Some(id) = id {
        let mut zones = ctx.zones.lock().unwrap();
        if let Some(entry) = zones.get_mut(&ctx.zone) {
            entry.state.reactor_handler = Some(id);
        }
    }
}

/// Run one refresh round for a zone: try each configured master in turn
/// (IXFR if we have a known serial, falling back to AXFR on `NOTIMP` or
/// after a cached IXFR refusal), commit a successful transfer, and
/// schedule the zone's next action.
fn run_refresh_attempt(ctx: Arc<RefreshCtx>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
    Box::pin(run_refresh_attempt_inner(ctx))
}

async fn run_refresh_attempt_inner(ctx: Arc<RefreshCtx>) {
    let now = ctx.clock.now_secs();

    let Some((master_index, master, known_serial, tsig_key_name)) = (|| {
        let zones = ctx.zones.lock().unwrap();
        let entry = zones.get(&ctx.zone)?;
        if entry.state.masters.is_empty() {
            return None;
        }
        let master_index = match entry.state.timer {
            RefreshTimerState::Transferring { master_index, .. } => master_index,
            _ => 0,
        };
        let master = *entry.state.masters.get(master_index)?;
        let known_serial = entry.state.current_serial().or(entry.state.serial_notify);
        Some((master_index, master, known_serial, entry.state.tsig_key_name.clone()))
    })() else {
        // No masters configured: nothing to do until the operator adds
        // one and issues a `reload`.
        return;
    };

    let zone_name = match zone_dname(&ctx.zone) {
        Ok(name) => name,
        Err(_) => return,
    };

    let tsig_pair = tsig_key_name.as_deref().and_then(|name| {
        let algorithm = ctx.registry.algo_lookup(name)?;
        ctx.registry.key_lookup(name, algorithm.name).map(|key| (key, algorithm))
    });

    let qtype = if known_serial.is_some()
        && !ignores_ixfr_for_now(&ctx, master_index, known_serial, now)
    {
        QTYPE_IXFR
    } else {
        QTYPE_AXFR
    };

    let query_id = crate::xfrd::transfer::random_query_id();
    let outcome = run_one_attempt(
        master,
        &zone_name,
        qtype,
        query_id,
        known_serial,
        tsig_pair,
        &ctx.journal_dir,
        &ctx.zone,
        now,
        &ctx.connect_pool,
    )
    .await;

    match outcome {
        Ok(AttemptOutcome::UpToDate) => {
            apply_up_to_date(&ctx, now);
            let deadline = next_deadline(&ctx, now);
            schedule_refresh(ctx, deadline).await;
        }
        Ok(AttemptOutcome::Applied { soa }) => {
            ctx.metrics.record_good_xfr(&ctx.zone);
            let new_serial = soa.serial;
            let notify_peers = apply_transfer(&ctx, &zone_name, soa, now);
            if !notify_peers.is_empty() {
                ctx.notify_io
                    .sender
                    .lock()
                    .unwrap()
                    .submit(ZoneNotifyJob::new(ctx.zone.clone(), new_serial, notify_peers), now);
            }
            let deadline = next_deadline(&ctx, now);
            schedule_refresh(ctx, deadline).await;
        }
        Err(TransferError::NotImplemented) if qtype == QTYPE_IXFR => {
            // The master doesn't speak IXFR; cache the refusal and retry
            // the same master with a full AXFR right away.
            {
                let mut zones = ctx.zones.lock().unwrap();
                if let Some(entry) = zones.get_mut(&ctx.zone) {
                    if let Some(serial) = known_serial {
                        entry.state.note_ixfr_refused(master_index, serial, now);
                    }
                }
            }
            schedule_refresh(ctx, Instant::now()).await;
        }
        Err(e) => {
            tracing::warn!(target: "xfrd", zone = %ctx.zone, master = %master, error = %e, "transfer attempt failed");
            ctx.metrics.record_bad_xfr(&ctx.zone);
            let deadline = on_attempt_failed(&ctx, master_index, now);
            schedule_refresh(ctx, deadline).await;
        }
    }
}

fn ignores_ixfr_for_now(ctx: &RefreshCtx, master_index: usize, known_serial: Option<u32>, now: u64) -> bool {
    let Some(serial) = known_serial else { return false };
    let zones = ctx.zones.lock().unwrap();
    zones
        .get(&ctx.zone)
        .map(|entry| entry.state.ixfr_is_cached_refused(master_index, serial, now))
        .unwrap_or(false)
}

fn apply_up_to_date(ctx: &RefreshCtx, now: u64) {
    let mut zones = ctx.zones.lock().unwrap();
    if let Some(entry) = zones.get_mut(&ctx.zone) {
        entry.last_success_at = Some(now);
        if let Some(soa) = entry.state.soa_disk.clone() {
            entry.state.refresh_after(&soa, now);
        }
    }
}

/// Commit a completed transfer: rebuild the in-memory zone content from
/// the journal that `xfrd::transfer::run_one_attempt` just appended to,
/// update the zone's refresh timer, and return the peers a NOTIFY should
/// now be sent to.
fn apply_transfer(
    ctx: &RefreshCtx,
    zone_name: &Dname,
    soa: crate::wire::packet::SoaRecord,
    now: u64,
) -> Vec<SocketAddr> {
    let rebuilt = ZoneContent::from_journal(&ctx.journal_dir, &ctx.zone, zone_name)
        .ok()
        .flatten()
        .map(Arc::new);

    let mut zones = ctx.zones.lock().unwrap();
    let Some(entry) = zones.get_mut(&ctx.zone) else {
        return Vec::new();
    };
    entry.last_success_at = Some(now);
    entry.state.refresh_after(&soa, now);
    if let Some(content) = rebuilt {
        entry.content = Some(content);
    }
    entry.do_notify_to.clone()
}

/// After every master in the rotation has failed once, back off; if the
/// zone's SOA `expire` interval has now elapsed since the last successful
/// transfer, mark it expired instead (the timer keeps ticking either
/// way — an expired zone still tries to refresh, it simply isn't served
/// to secondaries in the meantime, see [`server::mod`]'s use of
/// [`ZoneEntry::content`]).
fn on_attempt_failed(ctx: &RefreshCtx, master_index: usize, now: u64) -> Instant {
    let mut zones = ctx.zones.lock().unwrap();
    let Some(entry) = zones.get_mut(&ctx.zone) else {
        return Instant::now() + Duration::from_secs(60);
    };

    let mut engine = ZoneEngine::new(&mut entry.state);
    match engine.next_master(master_index) {
        Some(next) => {
            let attempt = match entry.state.timer {
                RefreshTimerState::Transferring { attempt, .. } => attempt + 1,
                _ => 0,
            };
            entry.state.timer = RefreshTimerState::Transferring { master_index: next, attempt };
            Instant::now()
        }
        None => {
            entry.state.enter_retry_backoff(now);
            if let Some(success) = entry.last_success_at {
                if now >= entry.state.expire_deadline(success) {
                    entry.state.mark_expired();
                }
            }
            deadline_from_timer(&entry.state.timer, now)
        }
    }
}

fn next_deadline(ctx: &RefreshCtx, now: u64) -> Instant {
    let zones = ctx.zones.lock().unwrap();
    match zones.get(&ctx.zone) {
        Some(entry) => deadline_from_timer(&entry.state.timer, now),
        None => Instant::now() + Duration::from_secs(3600),
    }
}

fn deadline_from_timer(timer: &RefreshTimerState, now: u64) -> Instant {
    let due_in = match timer {
        RefreshTimerState::Waiting { deadline } | RefreshTimerState::RetryBackoff { deadline } => {
            deadline.saturating_sub(now)
        }
        RefreshTimerState::Transferring { .. } => 0,
        RefreshTimerState::Expired => 3600,
    };
    Instant::now() + Duration::from_secs(due_in)
}

//----------- NOTIFY sender: UDP I/O around the pure state machine ---------------

/// Drive the NOTIFY state machine's retry timer and read acknowledgements
/// off the shared socket. Runs for the daemon's lifetime.
async fn run_notify_loop(
    notify_io: Arc<NotifyIo>,
    zones: SharedZones,
    clock: SharedClock,
    metrics: Arc<MetricsCollection>,
) {
    let mut retry_tick = tokio::time::interval(Duration::from_secs(1));
    let mut recv_buf = vec![0u8; 512];

    loop {
        tokio::select! {
            _ = retry_tick.tick() => {
                let now = clock.now_secs();
                let due = notify_io.sender.lock().unwrap().due_peers(now);
                for (zone, peer, serial) in due {
                    send_one_notify(&notify_io, &zones, &zone, peer, serial, &metrics).await;
                    notify_io.sender.lock().unwrap().record_attempt(&zone, peer, now);
                }
                drain_notify_outcomes(&notify_io);
            }
            result = notify_io.socket.recv_from(&mut recv_buf) => {
                let Ok((n, from)) = result else { continue };
                handle_notify_reply(&notify_io, &recv_buf[..n], from, clock.now_secs());
                drain_notify_outcomes(&notify_io);
            }
        }
    }
}

/// Log and clear every [`NotifyOutcome`] [`NotifySender`] has recorded
/// since the last drain, so `outcomes` doesn't grow without bound over the
/// daemon's lifetime.
fn drain_notify_outcomes(notify_io: &NotifyIo) {
    let outcomes = std::mem::take(&mut notify_io.sender.lock().unwrap().outcomes);
    for (zone, peer, outcome) in outcomes {
        match outcome {
            NotifyOutcome::Acked => {
                tracing::debug!(target: "notify", %zone, %peer, "notify acknowledged");
            }
            NotifyOutcome::RetriesExhausted => {
                tracing::warn!(target: "notify", %zone, %peer, retries = NOTIFY_MAX_RETRY, "giving up on notify after exhausting retries");
            }
        }
    }
}

async fn send_one_notify(
    notify_io: &NotifyIo,
    zones: &SharedZones,
    zone: &str,
    peer: SocketAddr,
    _serial: u32,
    metrics: &MetricsCollection,
) {
    let Ok(zone_name) = zone_dname(zone) else { return };
    let soa = zones
        .lock()
        .unwrap()
        .get(zone)
        .and_then(|entry| entry.state.soa_disk.clone());

    let Ok(mut buf) = Buffer::new(512) else { return };
    let id: u16 = rand::random();
    if encode_notify(&mut buf, id, &zone_name, soa.as_ref()).is_err() {
        return;
    }
    buf.flip();

    if notify_io.socket.send_to(buf.as_slice(), peer).await.is_ok() {
        notify_io
            .pending_ids
            .lock()
            .unwrap()
            .insert(id, (zone.to_string(), peer));
        metrics.record_notify_sent(zone);
    }
}

fn handle_notify_reply(notify_io: &NotifyIo, payload: &[u8], from: SocketAddr, now: u64) {
    let Ok(buf) = Buffer::from_bytes(payload) else { return };
    let Ok(id) = buf.header_id() else { return };

    let campaign = {
        let mut pending = notify_io.pending_ids.lock().unwrap();
        pending.remove(&id)
    };
    let Some((zone, peer)) = campaign else { return };
    if peer.ip() != from.ip() {
        return;
    }
    if is_notify_reply(&buf, id).unwrap_or(false) {
        notify_io.sender.lock().unwrap().record_ack(&zone, peer, now);
    }
}

//----------- NOTIFY receiver: unsolicited NOTIFY from a configured master -------

/// Accept unsolicited NOTIFYs on one listening address, checked against
/// the owning zone's `allow_notify_from` ACL before they're allowed to
/// pull a zone's refresh forward.
#[allow(clippy::too_many_arguments)]
async fn run_inbound_notify_listener(
    socket: UdpSocket,
    zones: SharedZones,
    registry: Arc<TsigRegistry>,
    journal_dir: Utf8PathBuf,
    clock: SharedClock,
    reactor: ReactorHandle,
    metrics: Arc<MetricsCollection>,
    notify_io: Arc<NotifyIo>,
    connect_pool: Arc<BoundedPool<String>>,
) {
    let mut buf = vec![0u8; 512];
    loop {
        let Ok((n, from)) = socket.recv_from(&mut buf).await else { continue };
        handle_inbound_notify(
            &buf[..n],
            from,
            &socket,
            &zones,
            &registry,
            &journal_dir,
            &clock,
            &reactor,
            &metrics,
            &notify_io,
            &connect_pool,
        )
        .await;
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_inbound_notify(
    payload: &[u8],
    from: SocketAddr,
    socket: &UdpSocket,
    zones: &SharedZones,
    registry: &Arc<TsigRegistry>,
    journal_dir: &Utf8PathBuf,
    clock: &SharedClock,
    reactor: &ReactorHandle,
    metrics: &Arc<MetricsCollection>,
    notify_io: &Arc<NotifyIo>,
    connect_pool: &Arc<BoundedPool<String>>,
) {
    let Ok(mut buf) = Buffer::from_bytes(payload) else { return };
    let Ok(query_id) = buf.header_id() else { return };
    if buf.opcode() != Ok(OPCODE_NOTIFY) {
        return;
    }
    if buf.set_position(12).is_err() {
        return;
    }
    let Ok(zone_name) = buf.read_dname() else { return };
    let Ok(qtype) = buf.read_u16() else { return };
    let Ok(_qclass) = buf.read_u16() else { return };
    for _ in 1..buf.qdcount().unwrap_or(1) {
        if buf.skip_dname().is_err() || buf.skip(4).is_err() {
            return;
        }
    }

    let mut serial = None;
    for i in 0..buf.ancount().unwrap_or(0) {
        if i == 0 {
            let Ok(rr) = crate::wire::packet::read_rr(&mut buf) else { return };
            serial = Buffer::from_bytes(&rr.rdata).ok().and_then(|mut rdata_buf| {
                crate::wire::packet::decode_soa_rdata(&mut rdata_buf).ok().map(|soa| soa.serial)
            });
        } else if buf.skip_rr().is_err() {
            return;
        }
    }
    for _ in 0..buf.nscount().unwrap_or(0) {
        if buf.skip_rr().is_err() {
            return;
        }
    }

    let now = clock.now_secs();
    let verified = server::verify_incoming_tsig(&mut buf, registry, now)
        .ok()
        .flatten()
        .map(|(summary, _transaction)| summary);

    let lookup = {
        let guard = zones.lock().unwrap();
        guard.iter().find_map(|(name, entry)| {
            let matches = zone_dname(name).map(|d| d.eq_ignore_case(&zone_name)).unwrap_or(false);
            matches.then(|| (name.clone(), entry.notify_acl.clone()))
        })
    };
    let Some((zone, acl)) = lookup else { return };
    if !acl.allows(from.ip(), from.port(), &verified) {
        tracing::debug!(target: "acl", %from, %zone, "rejecting notify, acl does not allow this peer");
        return;
    }

    let should_refresh = {
        let mut guard = zones.lock().unwrap();
        match guard.get_mut(&zone) {
            Some(entry) => {
                let refresh = entry.state.record_notify(serial, now);
                if refresh {
                    if let Some(id) = entry.state.reactor_handler.take() {
                        reactor.remove(id);
                    }
                }
                refresh
            }
            None => false,
        }
    };

    if should_refresh {
        let ctx = Arc::new(RefreshCtx {
            zone,
            zones: zones.clone(),
            registry: registry.clone(),
            journal_dir: journal_dir.clone(),
            clock: clock.clone(),
            reactor: reactor.clone(),
            metrics: metrics.clone(),
            notify_io: notify_io.clone(),
            connect_pool: connect_pool.clone(),
        });
        schedule_refresh(ctx, Instant::now()).await;
    }

    if let Ok(mut reply) = Buffer::new(512) {
        if encode_query(&mut reply, query_id, OPCODE_NOTIFY, &zone_name, qtype, QCLASS_IN).is_ok()
            && reply.set_qr(true).is_ok()
            && reply.set_aa(true).is_ok()
        {
            reply.flip();
            let _ = socket.send_to(reply.as_slice(), from).await;
        }
    }
}

//----------- outbound AXFR/IXFR server ------------------------------------------

/// Accept inbound transfer requests on one listening address, queuing
/// connections past [`crate::tcpset::TcpSet`]'s capacity in FIFO order
/// rather than refusing them outright, via [`BoundedPool::acquire`].
async fn run_inbound_listener(
    listener: TcpListener,
    zones: SharedZones,
    registry: Arc<TsigRegistry>,
    clock: SharedClock,
    metrics: Arc<MetricsCollection>,
    accept_pool: Arc<BoundedPool<SocketAddr>>,
) {
    loop {
        let Ok((stream, peer)) = listener.accept().await else { return };
        let zones = zones.clone();
        let registry = registry.clone();
        let clock = clock.clone();
        let metrics = metrics.clone();
        let accept_pool = accept_pool.clone();
        tokio::spawn(async move {
            let queued_behind = accept_pool.waiting_count();
            if queued_behind > 0 {
                tracing::debug!(target: "server", %peer, queued_behind, "inbound transfer queued, connection pool is full");
            }
            let _permit = accept_pool.acquire(peer).await;
            if let Err(e) = handle_inbound_transfer(stream, peer, zones, registry, clock, metrics).await {
                tracing::debug!(target: "server", %peer, error = %e, "inbound transfer failed");
            }
        });
    }
}

#[derive(Debug)]
enum InboundError {
    Wire(WireError),
    Tcp(crate::tcpset::TcpError),
}

impl std::fmt::Display for InboundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InboundError::Wire(e) => write!(f, "{e}"),
            InboundError::Tcp(e) => write!(f, "{e}"),
        }
    }
}

impl From<WireError> for InboundError {
    fn from(e: WireError) -> Self {
        InboundError::Wire(e)
    }
}

impl From<crate::tcpset::TcpError> for InboundError {
    fn from(e: crate::tcpset::TcpError) -> Self {
        InboundError::Tcp(e)
    }
}

async fn handle_inbound_transfer(
    mut stream: TcpStream,
    peer: SocketAddr,
    zones: SharedZones,
    registry: Arc<TsigRegistry>,
    clock: SharedClock,
    metrics: Arc<MetricsCollection>,
) -> Result<(), InboundError> {
    let now = clock.now_secs();
    let payload = read_framed(&mut stream).await?;
    let mut buf = Buffer::from_bytes(&payload)?;

    let query_id = buf.header_id()?;
    buf.set_position(12)?;
    let zone_name = buf.read_dname()?;
    let qtype = buf.read_u16()?;
    let _qclass = buf.read_u16()?;
    for _ in 1..buf.qdcount()? {
        buf.skip_dname()?;
        buf.skip(4)?;
    }
    for _ in 0..buf.ancount()? {
        buf.skip_rr()?;
    }
    for _ in 0..buf.nscount()? {
        buf.skip_rr()?;
    }

    let (verified, transaction) = match server::verify_incoming_tsig(&mut buf, &registry, now).ok().flatten() {
        Some((summary, transaction)) => (Some(summary), transaction),
        None => (None, None),
    };

    let lookup = {
        let guard = zones.lock().unwrap();
        guard.iter().find_map(|(name, entry)| {
            let matches = zone_dname(name).map(|d| d.eq_ignore_case(&zone_name)).unwrap_or(false);
            matches.then(|| (name.clone(), entry.provide_acl.clone(), entry.content.clone()))
        })
    };

    let Some((zone, acl, content)) = lookup else {
        return write_refusal(&mut stream, query_id).await;
    };

    let decision = server::decide(&acl, peer.ip(), peer.port(), &verified, qtype);
    let Some(content) = content.filter(|_| decision != RequestDecision::Refused) else {
        metrics.record_bad_xfr(&zone);
        return write_refusal(&mut stream, query_id).await;
    };

    // Chain the response's TSIG to the request's MAC (RFC 8945 §5.3.1) by
    // reusing the transaction `verify_incoming_tsig` verified the request
    // with. Requests with no TSIG, or an invalid one, get an unsigned
    // response.
    let mut transaction = transaction;
    let mut response_tsig = transaction
        .as_mut()
        .map(|t| server::ResponseTsig { tsig: &mut t.tsig, key_name: &t.key_name, algorithm_name: &t.algorithm_name });

    let messages = match decision {
        RequestDecision::Refused => {
            metrics.record_bad_xfr(&zone);
            return write_refusal(&mut stream, query_id).await;
        }
        RequestDecision::ServeAxfr => {
            server::build_axfr(query_id, &zone_name, &content, response_tsig.as_mut(), now)?
        }
        RequestDecision::ServeIxfr => {
            let from_serial = current_peer_serial(&payload).unwrap_or(content.soa.serial);
            match server::build_ixfr(query_id, &zone_name, &content, from_serial, response_tsig.as_mut(), now) {
                Some(result) => result?,
                None => server::build_axfr(query_id, &zone_name, &content, response_tsig.as_mut(), now)?,
            }
        }
    };

    for message in messages {
        write_framed(&mut stream, &message).await?;
    }
    metrics.record_good_xfr(&zone);
    Ok(())
}

/// The IXFR request's own SOA (its authority section carries the client's
/// current serial), read without disturbing the caller's already-advanced
/// buffer position.
fn current_peer_serial(payload: &[u8]) -> Option<u32> {
    let mut buf = Buffer::from_bytes(payload).ok()?;
    buf.set_position(12).ok()?;
    for _ in 0..buf.qdcount().ok()? {
        buf.skip_dname().ok()?;
        buf.skip(4).ok()?;
    }
    for _ in 0..buf.ancount().ok()? {
        buf.skip_rr().ok()?;
    }
    let rr = crate::wire::packet::read_rr(&mut buf).ok()?;
    let mut rdata_buf = Buffer::from_bytes(&rr.rdata).ok()?;
    crate::wire::packet::decode_soa_rdata(&mut rdata_buf).ok().map(|soa| soa.serial)
}

async fn write_refusal(stream: &mut TcpStream, query_id: u16) -> Result<(), InboundError> {
    const RCODE_REFUSED: u8 = 5;
    let mut buf = Buffer::new(512)?;
    buf.set_header_id(query_id)?;
    buf.set_qr(true)?;
    buf.set_rcode(RCODE_REFUSED)?;
    buf.flip();
    write_framed(stream, buf.as_slice()).await?;
    Ok(())
}

//----------- control socket ------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn run_control_loop(
    mut requests: mpsc::UnboundedReceiver<ControlRequest>,
    zones: SharedZones,
    registry: Arc<TsigRegistry>,
    journal_dir: Utf8PathBuf,
    clock: SharedClock,
    reactor: ReactorHandle,
    metrics: Arc<MetricsCollection>,
    notify_io: Arc<NotifyIo>,
    connect_pool: Arc<BoundedPool<String>>,
) {
    while let Some(request) = requests.recv().await {
        let response = match request.command {
            ControlCommand::Reload => {
                // Re-reading the TOML file and diffing it against the
                // live zone table is out of scope for this control
                // command today; `reload` only re-reads each zone's
                // journal, so a manually-retransferred zone's in-memory
                // content catches up without a daemon restart.
                let mut guard = zones.lock().unwrap();
                let mut reloaded = 0;
                for (zone, entry) in guard.iter_mut() {
                    if let Ok(zone_name) = zone_dname(zone) {
                        if let Ok(Some(content)) = ZoneContent::from_journal(&journal_dir, zone, &zone_name) {
                            entry.content = Some(Arc::new(content));
                            reloaded += 1;
                        }
                    }
                }
                ControlResponse::ok(vec![format!("reloaded {reloaded} zone(s) from their journals")])
            }
            ControlCommand::Retransfer(zone) => {
                let exists = zones.lock().unwrap().contains_key(&zone);
                if !exists {
                    ControlResponse::error(format!("unknown zone {zone:?}"))
                } else {
                    let ctx = Arc::new(RefreshCtx {
                        zone: zone.clone(),
                        zones: zones.clone(),
                        registry: registry.clone(),
                        journal_dir: journal_dir.clone(),
                        clock: clock.clone(),
                        reactor: reactor.clone(),
                        metrics: metrics.clone(),
                        notify_io: notify_io.clone(),
                        connect_pool: connect_pool.clone(),
                    });
                    {
                        let mut guard = zones.lock().unwrap();
                        if let Some(entry) = guard.get_mut(&zone) {
                            if let Some(id) = entry.state.reactor_handler.take() {
                                reactor.remove(id);
                            }
                        }
                    }
                    schedule_refresh(ctx, Instant::now()).await;
                    ControlResponse::ok(vec![format!("retransfer of {zone} scheduled")])
                }
            }
            ControlCommand::Status(zone) => {
                let mut guard = zones.lock().unwrap();
                match zone {
                    Some(zone) => match guard.get_mut(&zone) {
                        Some(entry) => ControlResponse::ok(vec![status_line(entry)]),
                        None => ControlResponse::error(format!("unknown zone {zone:?}")),
                    },
                    None => {
                        let lines = guard.values_mut().map(status_line).collect();
                        ControlResponse::ok(lines)
                    }
                }
            }
        };
        let _ = request.respond_to.send(response);
    }
}

fn status_line(entry: &mut ZoneEntry) -> String {
    let snapshot = ZoneEngine::new(&mut entry.state).status();
    let serial = snapshot.serial_disk.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string());
    let timer = match &snapshot.timer {
        RefreshTimerState::Waiting { deadline } => format!("waiting (due at {deadline})"),
        RefreshTimerState::Transferring { master_index, attempt } => {
            format!("transferring (master #{master_index}, attempt {attempt})")
        }
        RefreshTimerState::RetryBackoff { deadline } => format!("retry backoff (due at {deadline})"),
        RefreshTimerState::Expired => "expired".to_string(),
    };
    let notify = snapshot
        .serial_notify
        .map(|s| format!(", notified serial={s}"))
        .unwrap_or_default();
    format!("{}: serial={serial}{notify} round={} {timer}", snapshot.zone, snapshot.round)
}

//! # Destination Manager
//!
//! Owns every outbound [`Sender`], grouped into `connected` / `disconnected`
//! / `ready`, plus the background reconnector. Grounded on
//! `storage/forwarding/destination.c`: `dest_check_reconnected` (here
//! [`DestinationManager::promote_ready`], backdating replay export time by
//! 600s), `dest_send`/`dest_send_rr`/`dest_send_next` (distribution
//! dispatch), and the single group mutex plus `ready_empty` fast path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{self, RecvTimeoutError, Sender as CancelSender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::Distribution;
use crate::packet::PacketBuilder;
use crate::sender::{SendMode, SendStatus, Sender};
use crate::templates::{Odid, TemplateManager, TemplateType};

/// Replay export time is backdated by this many seconds so a reconnected
/// peer never sees a replayed template announcement with an export time
/// greater than a subsequent live message (`destination.c`).
const REPLAY_BACKDATE_SECS: u64 = 600;

/// One remote peer: its sender and its per-ODID sequence counters.
pub struct Destination {
    sender: Sender,
    seq_numbers: HashMap<Odid, u32>,
}

impl Destination {
    fn new(host: String, port: String) -> Self {
        Self { sender: Sender::new(host, port), seq_numbers: HashMap::new() }
    }

    fn seq_for(&mut self, odid: Odid) -> &mut u32 {
        self.seq_numbers.entry(odid).or_insert(0)
    }

    pub fn address(&self) -> &str {
        self.sender.address()
    }
}

enum SendOutcome {
    Ok,
    Busy,
    Closed,
}

struct Groups {
    connected: Vec<Destination>,
    disconnected: Vec<Destination>,
    ready: Vec<Destination>,
    round_robin_cursor: usize,
}

/// Owns the three destination groups, the reconnector thread, and
/// dispatches finalized packets according to [`Distribution`].
///
/// The template manager is not synchronized by this type: per spec.md §5
/// the caller must serialize `promote_ready`/`send` calls against template
/// manager mutation (both happen from the single dispatch caller thread).
pub struct DestinationManager {
    groups: Arc<Mutex<Groups>>,
    ready_empty: Arc<AtomicBool>,
    cancel_tx: Option<CancelSender<()>>,
    reconnector: Option<JoinHandle<()>>,
}

impl DestinationManager {
    pub fn new(destinations: Vec<(String, String)>, reconnection_period: Duration) -> Self {
        let groups = Arc::new(Mutex::new(Groups {
            connected: Vec::new(),
            disconnected: destinations.into_iter().map(|(h, p)| Destination::new(h, p)).collect(),
            ready: Vec::new(),
            round_robin_cursor: 0,
        }));
        let ready_empty = Arc::new(AtomicBool::new(true));
        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);

        let reconnector = {
            let groups = Arc::clone(&groups);
            let ready_empty = Arc::clone(&ready_empty);
            thread::spawn(move || loop {
                match cancel_rx.recv_timeout(reconnection_period) {
                    Ok(()) => break,
                    Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                let mut groups = groups.lock();
                let mut i = 0;
                while i < groups.disconnected.len() {
                    if groups.disconnected[i].sender.connect().is_ok() {
                        let dest = groups.disconnected.remove(i);
                        info!(address = %dest.address(), "destination reconnected");
                        groups.ready.push(dest);
                        ready_empty.store(false, Ordering::SeqCst);
                    } else {
                        i += 1;
                    }
                }
            })
        };

        Self { groups, ready_empty, cancel_tx: Some(cancel_tx), reconnector: Some(reconnector) }
    }

    /// Fast-path check run at the start of every dispatch call. If any
    /// destination reconnected since the last call, replays every known
    /// template to it before allowing it into `connected`.
    pub fn promote_ready(&self, templates: &TemplateManager) {
        if self.ready_empty.load(Ordering::SeqCst) {
            return;
        }

        let odids = templates.odids();
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
        let replay_export_time = now.saturating_sub(REPLAY_BACKDATE_SECS) as u32;

        let mut builders: Vec<(Odid, PacketBuilder<'static>)> = Vec::new();
        for odid in odids {
            let mut builder = PacketBuilder::new();
            builder.start(odid, replay_export_time);
            for ttype in [TemplateType::Normal, TemplateType::Options] {
                for (id, bytes) in templates.templates_of(odid, ttype) {
                    builder.add_template(&bytes, id, ttype);
                }
            }
            builder.end(u16::MAX);
            builders.push((odid, builder));
        }

        let mut groups = self.groups.lock();

        if builders.iter().all(|(_, b)| b.packet_count() == 0) {
            groups.connected.append(&mut groups.ready);
            self.ready_empty.store(true, Ordering::SeqCst);
            return;
        }

        let mut to_promote = Vec::new();
        let mut to_demote = Vec::new();

        for mut dest in groups.ready.drain(..) {
            let mut failed = false;
            'replay: for (odid, builder) in builders.iter_mut() {
                for idx in 0..builder.packet_count() {
                    let seq = *dest.seq_for(*odid);
                    let (bytes, record_count) = builder.emit_as_bytes(seq, idx, 0);
                    match dest.sender.send(&bytes, SendMode::NonBlocking, true) {
                        SendStatus::Ok => *dest.seq_for(*odid) += record_count,
                        _ => {
                            failed = true;
                            break 'replay;
                        }
                    }
                }
            }

            if failed {
                warn!(address = %dest.address(), "template replay failed, destination demoted");
                to_demote.push(dest);
            } else {
                info!(address = %dest.address(), "template replay completed, destination connected");
                to_promote.push(dest);
            }
        }

        groups.connected.extend(to_promote);
        groups.disconnected.extend(to_demote);
        self.ready_empty.store(true, Ordering::SeqCst);
    }

    fn send_all_packets(dest: &mut Destination, odid: Odid, builder: &mut PacketBuilder<'_>, required: bool) -> SendOutcome {
        let count = builder.packet_count();
        for idx in 0..count {
            let required_for_packet = if idx == 0 { required } else { true };
            let seq = *dest.seq_for(odid);
            let (iov, record_count) = builder.emit_as_iovec(seq, idx);
            match dest.sender.send_vectored(&iov, SendMode::NonBlocking, required_for_packet) {
                SendStatus::Ok => *dest.seq_for(odid) += record_count,
                SendStatus::Busy => {
                    debug!(address = %dest.address(), "destination busy, packet dropped");
                    return SendOutcome::Busy;
                }
                SendStatus::Closed | SendStatus::Invalid => return SendOutcome::Closed,
            }
        }
        SendOutcome::Ok
    }

    fn try_send_round_robin(groups: &mut Groups, odid: Odid, builder: &mut PacketBuilder<'_>, required: bool) -> Option<usize> {
        let total = groups.connected.len();
        if total == 0 {
            return None;
        }

        for attempt in 0..total {
            if groups.connected.is_empty() {
                return None;
            }
            let idx = (groups.round_robin_cursor + attempt) % groups.connected.len();
            match Self::send_all_packets(&mut groups.connected[idx], odid, builder, required) {
                SendOutcome::Ok => {
                    groups.round_robin_cursor = idx + 1;
                    return Some(idx);
                }
                SendOutcome::Busy => continue,
                SendOutcome::Closed => {
                    let dest = groups.connected.remove(idx);
                    groups.disconnected.push(dest);
                }
            }
        }
        None
    }

    /// Dispatches `builder_all`/`builder_templates` to `connected`
    /// destinations per `distribution`. `promote_ready` must have already
    /// been called for this dispatch cycle.
    pub fn send(&self, builder_all: &mut PacketBuilder<'_>, builder_templates: &mut PacketBuilder<'_>, distribution: Distribution) {
        let odid = builder_all.packet_odid();
        let required = builder_templates.packet_count() > 0;
        let mut groups = self.groups.lock();

        match distribution {
            Distribution::All => {
                let mut i = 0;
                while i < groups.connected.len() {
                    match Self::send_all_packets(&mut groups.connected[i], odid, builder_all, required) {
                        SendOutcome::Ok | SendOutcome::Busy => i += 1,
                        SendOutcome::Closed => {
                            let dest = groups.connected.remove(i);
                            groups.disconnected.push(dest);
                        }
                    }
                }
                if groups.connected.is_empty() {
                    warn!("all destinations disconnected, flows will be lost until reconnection");
                }
            }
            Distribution::RoundRobin => {
                if groups.connected.is_empty() {
                    return;
                }
                if required {
                    let chosen = Self::try_send_round_robin(&mut groups, odid, builder_all, true);
                    match chosen {
                        Some(chosen_idx) => {
                            let mut demote = Vec::new();
                            for (i, dest) in groups.connected.iter_mut().enumerate() {
                                if i == chosen_idx {
                                    continue;
                                }
                                if let SendOutcome::Closed = Self::send_all_packets(dest, odid, builder_templates, true) {
                                    demote.push(i);
                                }
                            }
                            for i in demote.into_iter().rev() {
                                let dest = groups.connected.remove(i);
                                groups.disconnected.push(dest);
                            }
                        }
                        None => warn!(odid, "round-robin dispatch failed, no destination accepted the required packet"),
                    }
                } else {
                    Self::try_send_round_robin(&mut groups, odid, builder_all, false);
                }
            }
        }
    }
}

impl Drop for DestinationManager {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.reconnector.take() {
            let _ = handle.join();
        }
    }
}

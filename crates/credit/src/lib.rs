#![deny(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(missing_docs)]

//! # Overview
//!
//! `credit` is the server's global flow-control scheduler. It decides, for
//! every active upload, how much additional send credit to hand out, subject
//! to a system-wide budget measured in whole chunks. It is the only
//! cross-upload shared mutable state on the server — a plain struct mutated
//! solely by the owning event loop, with no locking: a single owned struct
//! with `on_*` methods rather than an actor or a mutex-guarded value.
//!
//! # Design
//!
//! [`CreditController`] exposes four hooks: [`CreditController::on_accept`],
//! [`CreditController::on_write_complete`], [`CreditController::on_timeout`],
//! and [`CreditController::on_disconnect`]. [`CreditController::on_chunk_received`]
//! additionally tracks the per-chunk credit consumption that happens between
//! those events. Fair-share reallocation
//! ([`CreditController::rebalance`]) prefers the upload with the lowest
//! `credit_outstanding / maxqueue` ratio, breaking ties by oldest last
//! activity.
//!
//! # Invariants
//!
//! - `credit_outstanding <= maxqueue` for every tracked upload.
//! - The sum of `credit_outstanding` across all uploads never exceeds the
//!   configured global budget.
//! - The controller never hands out credit that implies a seek below the
//!   upload's own expected write position — credit is a count of additional
//!   chunks, not a byte range, so this holds by construction as long as
//!   callers only request credit through these hooks.

use std::collections::HashMap;

use tracing::{debug, warn};

/// Opaque per-upload key; in practice the transport's `ClientIdentity` bytes.
pub type Identity = Vec<u8>;

/// Action the event loop should take as a result of an idle-timeout sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Send a `status-report` probe to resynchronize an idle upload.
    Probe(Identity),
    /// The upload exceeded its unanswered-probe budget; it must be aborted.
    FatalTimeout(Identity),
}

#[derive(Debug, Clone)]
struct UploadState {
    maxqueue: u32,
    credit_outstanding: u32,
    last_activity: u64,
    unanswered_probes: u32,
}

impl UploadState {
    fn ratio(&self) -> f64 {
        if self.maxqueue == 0 {
            return f64::INFINITY;
        }
        f64::from(self.credit_outstanding) / f64::from(self.maxqueue)
    }
}

/// Global, single-owner credit scheduler for all concurrently active uploads.
#[derive(Debug)]
pub struct CreditController {
    budget_total: u32,
    budget_in_use: u32,
    fatal_probe_count: u32,
    uploads: HashMap<Identity, UploadState>,
}

impl CreditController {
    /// Creates a controller with the given global budget, measured in whole
    /// chunks of outstanding credit across all uploads.
    #[must_use]
    pub fn new(global_budget_chunks: u32) -> Self {
        Self::with_fatal_probe_count(global_budget_chunks, 3)
    }

    /// As [`CreditController::new`], but with an explicit fatal unanswered-probe
    /// count (how many consecutive idle probes an upload may miss before the
    /// controller reports it as fatally timed out).
    #[must_use]
    pub fn with_fatal_probe_count(global_budget_chunks: u32, fatal_probe_count: u32) -> Self {
        Self {
            budget_total: global_budget_chunks,
            budget_in_use: 0,
            fatal_probe_count: fatal_probe_count.max(1),
            uploads: HashMap::new(),
        }
    }

    fn available(&self) -> u32 {
        self.budget_total.saturating_sub(self.budget_in_use)
    }

    /// Registers a newly accepted upload and returns its initial credit
    /// (`<= maxqueue`, possibly zero if no budget is currently available).
    pub fn on_accept(&mut self, identity: Identity, maxqueue: u32, now: u64) -> u32 {
        let initial = maxqueue.min(self.available());
        self.budget_in_use += initial;
        debug!(maxqueue, initial, "upload accepted into credit controller");
        self.uploads.insert(
            identity,
            UploadState {
                maxqueue,
                credit_outstanding: initial,
                last_activity: now,
                unanswered_probes: 0,
            },
        );
        initial
    }

    /// Records that one unit of credit was consumed by an accepted chunk.
    ///
    /// Returns `false` if the identity is unknown (already disconnected),
    /// in which case the caller should treat the chunk as stale.
    pub fn on_chunk_received(&mut self, identity: &Identity, now: u64) -> bool {
        let Some(state) = self.uploads.get_mut(identity) else {
            return false;
        };
        state.credit_outstanding = state.credit_outstanding.saturating_sub(1);
        state.last_activity = now;
        state.unanswered_probes = 0;
        true
    }

    /// Called after a chunk write has durably landed in storage. Attempts to
    /// top the upload's credit back up toward its `maxqueue`, subject to the
    /// global budget, and returns the amount granted (`None` if none could be
    /// granted).
    pub fn on_write_complete(&mut self, identity: &Identity, now: u64) -> Option<u32> {
        let available = self.available();
        let state = self.uploads.get_mut(identity)?;
        state.last_activity = now;
        let room = state.maxqueue.saturating_sub(state.credit_outstanding);
        let grant = room.min(available);
        if grant == 0 {
            return None;
        }
        state.credit_outstanding += grant;
        self.budget_in_use += grant;
        debug!(grant, "granting additional transfer credit");
        Some(grant)
    }

    /// Sweeps all tracked uploads for idleness. Any upload that has not
    /// produced activity within `idle_timeout_ms` is either probed (if it
    /// still has unanswered-probe budget) or reported as fatally timed out.
    ///
    /// Uploads reported as [`TimeoutAction::FatalTimeout`] are removed and
    /// their budget released; callers must still abort upload state
    /// elsewhere (staging cleanup, peer notification).
    pub fn on_timeout(&mut self, now: u64, idle_timeout_ms: u64) -> Vec<TimeoutAction> {
        let mut actions = Vec::new();
        let mut fatal = Vec::new();

        for (identity, state) in &mut self.uploads {
            if now.saturating_sub(state.last_activity) < idle_timeout_ms {
                continue;
            }
            if state.unanswered_probes + 1 > self.fatal_probe_count {
                fatal.push(identity.clone());
                continue;
            }
            state.unanswered_probes += 1;
            state.last_activity = now;
            actions.push(TimeoutAction::Probe(identity.clone()));
        }

        for identity in fatal {
            self.release(&identity);
            warn!(?identity, "upload exceeded unanswered-probe budget");
            actions.push(TimeoutAction::FatalTimeout(identity));
        }

        actions
    }

    /// Releases an upload's budget and stops tracking it, e.g. on
    /// completion, abort, or permanent disconnect. Must not be called for a
    /// transport hiccup the server intends to resume across — resumption
    /// keeps the upload's credit state intact.
    pub fn on_disconnect(&mut self, identity: &Identity) {
        self.release(identity);
    }

    fn release(&mut self, identity: &Identity) {
        if let Some(state) = self.uploads.remove(identity) {
            self.budget_in_use = self.budget_in_use.saturating_sub(state.credit_outstanding);
        }
    }

    /// Reissues credit up to `maxqueue` for a resumed upload after a
    /// transport reconnect, for the `status-report`/`query-status`
    /// resynchronization handshake.
    pub fn reissue_after_resume(&mut self, identity: &Identity, now: u64) -> Option<u32> {
        self.on_write_complete(identity, now)
    }

    /// Returns the credit currently outstanding for `identity`, if tracked.
    #[must_use]
    pub fn credit_outstanding(&self, identity: &Identity) -> Option<u32> {
        self.uploads.get(identity).map(|s| s.credit_outstanding)
    }

    /// Distributes any currently-free global budget across uploads competing
    /// for it, one chunk of credit at a time, always handing the next unit to
    /// whichever upload currently has the lowest `credit_outstanding /
    /// maxqueue` ratio and breaking ties by oldest `last_activity`. Returns
    /// the total granted per upload, in the order each first received
    /// credit.
    pub fn rebalance(&mut self, now: u64) -> Vec<(Identity, u32)> {
        let mut order: Vec<Identity> = Vec::new();
        let mut granted: HashMap<Identity, u32> = HashMap::new();

        while self.available() > 0 {
            let Some(identity) = self
                .uploads
                .iter()
                .filter(|(_, s)| s.credit_outstanding < s.maxqueue)
                .min_by(|(_, a), (_, b)| {
                    a.ratio()
                        .partial_cmp(&b.ratio())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.last_activity.cmp(&b.last_activity))
                })
                .map(|(identity, _)| identity.clone())
            else {
                break;
            };

            let state = self
                .uploads
                .get_mut(&identity)
                .expect("candidate came from self.uploads");
            state.credit_outstanding += 1;
            state.last_activity = now;
            self.budget_in_use += 1;

            granted
                .entry(identity.clone())
                .and_modify(|amount| *amount += 1)
                .or_insert_with(|| {
                    order.push(identity.clone());
                    1
                });
        }

        order
            .into_iter()
            .map(|identity| {
                let amount = granted[&identity];
                (identity, amount)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> Identity {
        vec![n]
    }

    #[test]
    fn on_accept_caps_initial_credit_at_maxqueue_and_budget() {
        let mut controller = CreditController::new(5);
        assert_eq!(controller.on_accept(id(1), 3, 0), 3);
        // Only 2 units of global budget remain.
        assert_eq!(controller.on_accept(id(2), 3, 0), 2);
    }

    #[test]
    fn credit_outstanding_never_exceeds_maxqueue() {
        let mut controller = CreditController::new(100);
        controller.on_accept(id(1), 2, 0);
        controller.on_write_complete(&id(1), 1);
        controller.on_write_complete(&id(1), 2);
        controller.on_write_complete(&id(1), 3);
        assert_eq!(controller.credit_outstanding(&id(1)), Some(2));
    }

    #[test]
    fn chunk_received_decrements_and_write_complete_tops_up() {
        let mut controller = CreditController::new(10);
        controller.on_accept(id(1), 4, 0);
        controller.on_chunk_received(&id(1), 1);
        assert_eq!(controller.credit_outstanding(&id(1)), Some(3));

        let grant = controller.on_write_complete(&id(1), 2);
        assert_eq!(grant, Some(1));
        assert_eq!(controller.credit_outstanding(&id(1)), Some(4));
    }

    #[test]
    fn timeout_probes_then_reports_fatal_after_budget_exceeded() {
        let mut controller = CreditController::with_fatal_probe_count(10, 2);
        controller.on_accept(id(1), 4, 0);

        let actions = controller.on_timeout(1_000, 1_000);
        assert_eq!(actions, vec![TimeoutAction::Probe(id(1))]);

        let actions = controller.on_timeout(2_000, 1_000);
        assert_eq!(actions, vec![TimeoutAction::Probe(id(1))]);

        let actions = controller.on_timeout(3_000, 1_000);
        assert_eq!(actions, vec![TimeoutAction::FatalTimeout(id(1))]);
        assert_eq!(controller.credit_outstanding(&id(1)), None);
    }

    #[test]
    fn disconnect_releases_budget_for_other_uploads() {
        let mut controller = CreditController::new(3);
        controller.on_accept(id(1), 3, 0);
        assert_eq!(controller.on_accept(id(2), 3, 0), 0);

        controller.on_disconnect(&id(1));
        assert_eq!(controller.on_accept(id(3), 3, 0), 3);
    }

    #[test]
    fn rebalance_prefers_lowest_ratio_then_oldest_activity() {
        let mut controller = CreditController::new(2);
        // Exhausts the budget up front so both real uploads start at zero
        // credit; releasing it below is what `rebalance` redistributes.
        controller.on_accept(id(3), 2, 0);
        controller.on_accept(id(1), 4, 10); // ratio 0, activity 10
        controller.on_accept(id(2), 4, 5); // ratio 0, activity 5 (older)
        controller.on_disconnect(&id(3));

        let grants = controller.rebalance(20);
        assert_eq!(grants, vec![(id(2), 1), (id(1), 1)]);
    }
}

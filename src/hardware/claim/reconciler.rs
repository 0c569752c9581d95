//! Claim Reconciler
//!
//! Binds pending claims to devices and keeps bindings consistent with the
//! inventory as devices come and go.
//!
//! The claim book mutex doubles as the selection lock: choosing a device
//! and binding it happen under it, so two claims can never pick the same
//! device. The inventory's per-identity bind check is the second, independent
//! guard. Publishing always happens after both locks are released.

use super::selection::rank_candidates;
use crate::domain::{
    ClaimKey, ClaimPhase, ClaimPublisherRef, ClaimRequest, DeviceIdentity, DevicePublisherRef,
};
use crate::error::{Error, Result};
use crate::hardware::inventory::{sync_device, DeviceInventory, InventoryEvent};
use crate::metrics::AgentMetrics;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the claim reconciler
#[derive(Debug, Clone)]
pub struct ClaimReconcilerConfig {
    /// Node this agent runs on; only claims targeting it are matched
    pub host: String,
    /// Warn once when a claim stays pending longer than this
    pub pending_warn_after: Duration,
}

impl Default for ClaimReconcilerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            pending_warn_after: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Claim Book
// =============================================================================

#[derive(Debug, Clone)]
struct TrackedClaim {
    request: ClaimRequest,
    /// Long-pending warning already logged
    pending_warned: bool,
    /// Last phase publication failed and must be retried
    dirty: bool,
}

impl TrackedClaim {
    fn new(request: ClaimRequest) -> Self {
        Self {
            request,
            pending_warned: false,
            dirty: false,
        }
    }
}

/// Outcome of confirming an adopted binding against the inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Restore {
    /// Inventory already records this claim as holder
    Held,
    Restored,
    /// Device not (yet) eligible; try again on a later event
    Deferred,
    /// Held by another claim, or gone for good
    Rejected,
}

/// Outward work collected under the lock and performed after it
#[derive(Debug, Default)]
struct Changes {
    claims: Vec<ClaimRequest>,
    devices: Vec<DeviceIdentity>,
}

impl Changes {
    fn claim(&mut self, request: &ClaimRequest) {
        self.claims.push(request.clone());
    }

    fn device(&mut self, identity: &DeviceIdentity) {
        if !self.devices.contains(identity) {
            self.devices.push(identity.clone());
        }
    }

    fn merge(&mut self, other: Changes) {
        self.claims.extend(other.claims);
        for identity in other.devices {
            self.device(&identity);
        }
    }
}

// =============================================================================
// Claim Reconciler
// =============================================================================

/// Matches claims to devices in the shared inventory
pub struct ClaimReconciler {
    config: ClaimReconcilerConfig,
    inventory: Arc<DeviceInventory>,
    book: Mutex<BTreeMap<ClaimKey, TrackedClaim>>,
    /// Set once a full device scan has reached the inventory; from then on
    /// a binding to an absent device is dangling
    inventory_complete: AtomicBool,
    claim_publisher: ClaimPublisherRef,
    device_publisher: DevicePublisherRef,
    metrics: Arc<AgentMetrics>,
}

impl ClaimReconciler {
    pub fn new(
        config: ClaimReconcilerConfig,
        inventory: Arc<DeviceInventory>,
        claim_publisher: ClaimPublisherRef,
        device_publisher: DevicePublisherRef,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        Self {
            config,
            inventory,
            book: Mutex::new(BTreeMap::new()),
            inventory_complete: AtomicBool::new(false),
            claim_publisher,
            device_publisher,
            metrics,
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Current local view of a claim
    pub fn claim(&self, key: &ClaimKey) -> Option<ClaimRequest> {
        self.book.lock().get(key).map(|t| t.request.clone())
    }

    /// All tracked claims in key order
    pub fn claims(&self) -> Vec<ClaimRequest> {
        self.book.lock().values().map(|t| t.request.clone()).collect()
    }

    /// Record that every device present on the node has been through the
    /// pipeline. Call `rescan` afterwards to release dangling bindings.
    pub fn mark_inventory_complete(&self) {
        if !self.inventory_complete.swap(true, Ordering::SeqCst) {
            info!("Initial device scan applied to inventory");
        }
    }

    pub fn inventory_complete(&self) -> bool {
        self.inventory_complete.load(Ordering::SeqCst)
    }

    // =========================================================================
    // Claim notifications
    // =========================================================================

    /// A claim was created or its spec changed
    #[instrument(skip(self, request), fields(claim = %request.key))]
    pub async fn on_claim_upserted(&self, request: ClaimRequest) -> Result<()> {
        let changes = {
            let mut book = self.book.lock();
            let mut changes = Changes::default();
            let local = request.target_host == self.config.host;

            match book.get_mut(&request.key) {
                Some(tracked) => match tracked.request.phase {
                    ClaimPhase::Bound => {
                        if !tracked.request.same_spec(&request) {
                            debug!("Spec change on bound claim ignored");
                        }
                    }
                    _ => {
                        tracked.request.requested_capacity = request.requested_capacity;
                        tracked.request.drive_type = request.drive_type;
                        tracked.request.target_host = request.target_host.clone();
                        if local && tracked.request.phase == ClaimPhase::Empty {
                            tracked.request.mark_pending();
                            changes.claim(&tracked.request);
                        }
                    }
                },
                None => {
                    let mut tracked = TrackedClaim::new(request.clone());
                    if local {
                        match (request.phase, request.bound_device.clone()) {
                            (ClaimPhase::Bound, Some(device)) => {
                                // Binding recorded before a restart; confirmed
                                // against the inventory by restore_bindings
                                info!(device = %device, "Adopting existing binding");
                                tracked.request.mark_bound(device);
                            }
                            _ => {
                                tracked.request.mark_pending();
                                changes.claim(&tracked.request);
                            }
                        }
                    } else {
                        debug!(host = %request.target_host, "Tracking claim for another node");
                    }
                    book.insert(request.key.clone(), tracked);
                }
            }

            changes.merge(self.restore_bindings(&mut book, None));
            changes.merge(self.match_pending(&mut book, Some(&request.key)));
            self.update_gauges(&book);
            changes
        };

        self.publish(changes).await;
        Ok(())
    }

    /// A claim was deleted; its device, if any, is released
    #[instrument(skip(self), fields(claim = %key))]
    pub async fn on_claim_deleted(&self, key: &ClaimKey) -> Result<()> {
        let changes = {
            let mut book = self.book.lock();
            let Some(tracked) = book.remove(key) else {
                return Err(Error::ClaimNotFound {
                    claim: key.to_string(),
                });
            };

            let mut changes = Changes::default();
            if let Some(device) = &tracked.request.bound_device {
                match self.inventory.release(device, key) {
                    Ok(_) => {
                        info!(device = %device, "Device released");
                        changes.device(device);
                    }
                    Err(e) => debug!(device = %device, error = %e, "Bound device not in inventory"),
                }
                changes.merge(self.match_pending(&mut book, None));
            }
            self.update_gauges(&book);
            changes
        };

        self.publish(changes).await;
        Ok(())
    }

    // =========================================================================
    // Inventory notifications
    // =========================================================================

    /// React to an inventory write
    pub async fn on_inventory_event(&self, event: &InventoryEvent) -> Result<()> {
        let changes = match event {
            InventoryEvent::Stale { identity, .. } => {
                let mut book = self.book.lock();
                let mut changes = self.unbind_stale(&mut book, identity);
                changes.merge(self.match_pending(&mut book, None));
                self.update_gauges(&book);
                changes
            }
            event if event.offers_capacity() => {
                let mut book = self.book.lock();
                let mut changes = self.restore_bindings(&mut book, Some(event.identity()));
                changes.merge(self.match_pending(&mut book, None));
                self.update_gauges(&book);
                changes
            }
            _ => return Ok(()),
        };

        self.publish(changes).await;
        Ok(())
    }

    /// Full pass: unbind stale devices, confirm adopted bindings, retry
    /// pending claims, republish failed publications and warn about
    /// long-pending claims
    #[instrument(skip(self))]
    pub async fn rescan(&self) -> Result<()> {
        let changes = {
            let mut book = self.book.lock();
            let mut changes = Changes::default();

            for (identity, _) in self.inventory.stale_entries() {
                changes.merge(self.unbind_stale(&mut book, &identity));
            }
            changes.merge(self.restore_bindings(&mut book, None));
            changes.merge(self.match_pending(&mut book, None));

            for tracked in book.values_mut() {
                if tracked.dirty {
                    tracked.dirty = false;
                    changes.claim(&tracked.request);
                }
                self.warn_if_long_pending(tracked);
            }

            self.update_gauges(&book);
            changes
        };

        self.publish(changes).await;
        Ok(())
    }

    // =========================================================================
    // Matching (caller holds the book lock)
    // =========================================================================

    /// Try to bind pending local claims, in key order. `only` restricts the
    /// pass to one claim.
    fn match_pending(
        &self,
        book: &mut BTreeMap<ClaimKey, TrackedClaim>,
        only: Option<&ClaimKey>,
    ) -> Changes {
        let mut changes = Changes::default();

        // Devices referenced by a claim whose binding is not yet restored in
        // the inventory
        let mut referenced: HashSet<DeviceIdentity> = book
            .values()
            .filter_map(|t| t.request.bound_device.clone())
            .collect();

        for (key, tracked) in book.iter_mut() {
            if only.is_some_and(|k| k != key) {
                continue;
            }
            let claim = &mut tracked.request;
            if claim.phase != ClaimPhase::Pending || claim.target_host != self.config.host {
                continue;
            }

            self.metrics.claim_match_attempts.inc();
            let candidates = rank_candidates(
                self.inventory.eligible(
                    &claim.target_host,
                    claim.requested_capacity,
                    claim.drive_type,
                ),
                claim,
            );

            let mut handled = false;
            for candidate in candidates {
                if referenced.contains(&candidate.identity) {
                    debug!(claim = %key, device = %candidate.identity, "Device reserved by another claim");
                    continue;
                }

                match self.inventory.bind(&candidate.identity, key) {
                    Ok(record) => {
                        info!(
                            claim = %key,
                            device = %record.identity,
                            path = %record.path,
                            capacity = record.capacity_bytes,
                            "Claim bound"
                        );
                        claim.mark_bound(record.identity.clone());
                        tracked.pending_warned = false;
                        referenced.insert(record.identity.clone());
                        self.metrics.claim_match_success.inc();
                        changes.claim(claim);
                        changes.device(&record.identity);
                        handled = true;
                        break;
                    }
                    Err(e @ Error::ExclusivityViolation { .. }) => {
                        error!(claim = %key, error = %e, "Exclusivity violation, claim stays pending");
                        self.metrics.claim_exclusivity_violations.inc();
                        // Retried on the next trigger
                        handled = true;
                        break;
                    }
                    Err(e) => {
                        debug!(claim = %key, device = %candidate.identity, error = %e, "Candidate no longer eligible");
                    }
                }
            }

            if !handled {
                let e = Error::MatchNotFound {
                    claim: key.to_string(),
                };
                debug!(error = %e, "Claim stays pending");
                self.metrics.claim_match_failures.inc();
            }
        }

        changes
    }

    /// Drop a stale device and return its claim to Pending
    fn unbind_stale(
        &self,
        book: &mut BTreeMap<ClaimKey, TrackedClaim>,
        identity: &DeviceIdentity,
    ) -> Changes {
        let mut changes = Changes::default();
        let Some(claim_ref) = self.inventory.release_stale(identity) else {
            return changes;
        };

        if let Some(tracked) = book.get_mut(&claim_ref.claim) {
            if tracked.request.bound_device.as_ref() == Some(identity) {
                warn!(
                    claim = %claim_ref.claim,
                    device = %identity,
                    "Bound device disappeared, claim returned to pending"
                );
                tracked.request.mark_pending();
                tracked.pending_warned = false;
                changes.claim(&tracked.request);
            }
        }
        changes
    }

    /// Re-mark devices held by bound claims (after a restart the inventory
    /// starts empty while claims still carry their binding). A binding the
    /// inventory rejects, or one to a device that is gone after a full scan,
    /// returns the claim to Pending.
    fn restore_bindings(
        &self,
        book: &mut BTreeMap<ClaimKey, TrackedClaim>,
        only: Option<&DeviceIdentity>,
    ) -> Changes {
        let mut changes = Changes::default();
        let complete = self.inventory_complete();

        for (key, tracked) in book.iter_mut() {
            let claim = &mut tracked.request;
            if claim.phase != ClaimPhase::Bound || claim.target_host != self.config.host {
                continue;
            }
            let Some(device) = claim.bound_device.clone() else {
                continue;
            };
            if only.is_some_and(|d| d != &device) {
                continue;
            }

            match self.restore_binding(key, &device, complete) {
                Restore::Held | Restore::Deferred => {}
                Restore::Restored => changes.device(&device),
                Restore::Rejected => {
                    claim.mark_pending();
                    tracked.pending_warned = false;
                    changes.claim(claim);
                }
            }
        }
        changes
    }

    fn restore_binding(&self, key: &ClaimKey, device: &DeviceIdentity, complete: bool) -> Restore {
        let Some(record) = self.inventory.get(device) else {
            if complete {
                warn!(claim = %key, device = %device, "Bound device not present on node, claim returned to pending");
                return Restore::Rejected;
            }
            return Restore::Deferred;
        };
        if record.claim_state.holder() == Some(key) {
            return Restore::Held;
        }
        match self.inventory.bind(device, key) {
            Ok(_) => {
                debug!(claim = %key, device = %device, "Binding restored");
                Restore::Restored
            }
            Err(e @ Error::ExclusivityViolation { .. }) => {
                error!(claim = %key, error = %e, "Binding rejected, claim returned to pending");
                self.metrics.claim_exclusivity_violations.inc();
                Restore::Rejected
            }
            Err(e) => {
                debug!(claim = %key, error = %e, "Binding not restorable yet");
                Restore::Deferred
            }
        }
    }

    fn warn_if_long_pending(&self, tracked: &mut TrackedClaim) {
        let claim = &tracked.request;
        if tracked.pending_warned
            || claim.phase != ClaimPhase::Pending
            || claim.target_host != self.config.host
        {
            return;
        }
        let Some(since) = claim.pending_since else {
            return;
        };
        let pending_for = (Utc::now() - since).to_std().unwrap_or_default();
        if pending_for >= self.config.pending_warn_after {
            warn!(
                claim = %claim.key,
                pending_secs = pending_for.as_secs(),
                capacity = claim.requested_capacity,
                "Claim pending for a long time, no eligible device"
            );
            tracked.pending_warned = true;
        }
    }

    fn update_gauges(&self, book: &BTreeMap<ClaimKey, TrackedClaim>) {
        let local = book
            .values()
            .filter(|t| t.request.target_host == self.config.host);
        let (mut pending, mut bound) = (0, 0);
        for tracked in local {
            match tracked.request.phase {
                ClaimPhase::Pending => pending += 1,
                ClaimPhase::Bound => bound += 1,
                ClaimPhase::Empty => {}
            }
        }
        self.metrics.claims_pending.set(pending);
        self.metrics.claims_bound.set(bound);
    }

    // =========================================================================
    // Publishing (no locks held)
    // =========================================================================

    async fn publish(&self, changes: Changes) {
        for identity in &changes.devices {
            if let Err(e) =
                sync_device(&self.inventory, self.device_publisher.as_ref(), identity).await
            {
                warn!(device = %identity, error = %e, "Failed to publish device");
            }
        }

        for claim in &changes.claims {
            if let Err(e) = self.claim_publisher.publish_claim_phase(claim).await {
                warn!(claim = %claim.key, phase = %claim.phase, error = %e, "Failed to publish claim phase");
                if let Some(tracked) = self.book.lock().get_mut(&claim.key) {
                    tracked.dirty = true;
                }
            }
        }
    }
}

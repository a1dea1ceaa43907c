//! Order reconciliation core
//!
//! The authoritative in-process view of every order the bot has placed.
//! Consumes decoded stream events and gateway acknowledgements, applies the
//! lifecycle state machine, and emits decisions (`SpawnClosingOrder`,
//! `CancelOrder`, `SlotFreed`) for the controller to execute. Performs no
//! I/O and holds no locks; the controller task owns it and funnels every
//! mutation through its own loop.
//!
//! Lifecycle: `Submitting → Open → {PartiallyFilled ⇄ Open} → Filled →
//! ClosingPlaced → Closed`, with `Canceled` reachable before the fill
//! completes and `Expired` (cancel requested, unconfirmed) on staleness.

use crate::types::{
    Decision, Order, OrderRecord, OrderRole, OrderSnapshot, OrderState, StreamEvent,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// In-memory order view plus the pending decision queue
pub struct ReconciliationCore {
    /// Live orders keyed by client tag (the one identifier known from birth)
    orders: HashMap<String, Order>,
    /// Exchange id -> client tag, populated as ids are learned
    by_exchange_id: HashMap<String, String>,
    /// Decisions awaiting the controller, in emission order
    decisions: VecDeque<Decision>,
    /// Opening orders (by client tag) that already emitted SpawnClosingOrder
    spawned: HashSet<String>,
    /// Occupied position slots; never exceeds `max_orders`
    occupied: usize,
    max_orders: usize,
    stale_after: Duration,
}

impl ReconciliationCore {
    pub fn new(max_orders: usize, stale_after: Duration) -> Self {
        Self {
            orders: HashMap::new(),
            by_exchange_id: HashMap::new(),
            decisions: VecDeque::new(),
            spawned: HashSet::new(),
            occupied: 0,
            max_orders,
            stale_after,
        }
    }

    pub fn occupied_slots(&self) -> usize {
        self.occupied
    }

    pub fn has_capacity(&self) -> bool {
        self.occupied < self.max_orders
    }

    /// Whether any order is still live (used by the shutdown drain)
    pub fn is_idle(&self) -> bool {
        self.orders.is_empty()
    }

    /// Read-only copy of the live orders for the observability sink
    pub fn live_orders(&self) -> Vec<Order> {
        self.orders.values().cloned().collect()
    }

    /// Exchange ids of orders the shutdown sequence should cancel
    pub fn cancellable_order_ids(&self) -> Vec<String> {
        self.orders
            .values()
            .filter(|o| {
                matches!(o.state, OrderState::Open | OrderState::PartiallyFilled)
                    && !o.id.is_empty()
            })
            .map(|o| o.id.clone())
            .collect()
    }

    /// Decisions in emission order, consumed exactly once
    pub fn drain_decisions(&mut self) -> Vec<Decision> {
        self.decisions.drain(..).collect()
    }

    /// Track a new opening order in `Submitting` state, occupying a slot.
    /// Returns false (and tracks nothing) if every slot is occupied.
    pub fn register_opening(&mut self, order: Order) -> bool {
        debug_assert_eq!(order.role, OrderRole::Opening);
        if !self.has_capacity() {
            warn!(
                "[Core] Refusing opening order {}: {}/{} slots occupied",
                order.client_tag, self.occupied, self.max_orders
            );
            return false;
        }
        self.occupied += 1;
        self.orders.insert(order.client_tag.clone(), order);
        true
    }

    /// Track the closing order submitted for a filled opening order and move
    /// the parent to `ClosingPlaced`. The slot stays occupied until the
    /// closing order terminates.
    pub fn register_closing(&mut self, order: Order) {
        debug_assert_eq!(order.role, OrderRole::Closing);
        if let Some(parent_tag) = order
            .parent_id
            .as_ref()
            .and_then(|id| self.by_exchange_id.get(id))
            .cloned()
        {
            if let Some(parent) = self.orders.get_mut(&parent_tag) {
                parent.state = OrderState::ClosingPlaced;
                parent.last_update = Utc::now();
            }
        }
        self.orders.insert(order.client_tag.clone(), order);
    }

    /// Gateway acknowledged a placement: learn the exchange id and move
    /// `Submitting → Open`. A fill event racing ahead of the ack may already
    /// have promoted the order, in which case only the id mapping is ensured.
    pub fn acknowledge(&mut self, client_tag: &str, order_id: &str) {
        let Some(order) = self.orders.get_mut(client_tag) else {
            debug!("[Core] Ack for unknown tag {}", client_tag);
            return;
        };
        if order.id.is_empty() {
            order.id = order_id.to_string();
            self.by_exchange_id
                .insert(order_id.to_string(), client_tag.to_string());
        }
        if order.state == OrderState::Submitting {
            order.state = OrderState::Open;
            order.last_update = Utc::now();
        }
    }

    /// Placement failed terminally (rejected, or transient retries
    /// exhausted). Discards the order and releases its slot.
    pub fn placement_failed(&mut self, client_tag: &str) {
        let Some(mut order) = self.orders.remove(client_tag) else {
            return;
        };
        if !order.id.is_empty() {
            self.by_exchange_id.remove(&order.id);
        }
        order.state = OrderState::Canceled;

        match order.role {
            OrderRole::Opening => {
                self.release_slot();
                self.decisions.push_back(Decision::SlotFreed {
                    record: record_of(&order, None, None),
                });
            }
            OrderRole::Closing => {
                // The opening fill is real but its close could not be placed.
                // Abandon the pair: free the slot and surface the failure so
                // the operator can flatten the residual position by hand.
                error!(
                    "[Core] Closing order for parent {:?} could not be placed; abandoning pair",
                    order.parent_id
                );
                if let Some(parent_tag) = order
                    .parent_id
                    .as_ref()
                    .and_then(|id| self.by_exchange_id.get(id))
                    .cloned()
                {
                    self.finish_round_trip(&parent_tag, &order, None);
                }
            }
        }
    }

    /// Apply one decoded stream event. Events for the same order arrive in
    /// receipt order; nothing is assumed about ordering across orders.
    pub fn apply(&mut self, event: &StreamEvent) {
        match event {
            StreamEvent::OrderAccepted {
                order_id,
                client_tag,
            } => {
                if let Some(tag) = self.resolve_tag(order_id, client_tag) {
                    self.acknowledge(&tag, order_id);
                }
            }
            StreamEvent::OrderPartiallyFilled {
                order_id,
                client_tag,
                cumulative_qty,
                avg_price,
            } => {
                self.on_fill(order_id, client_tag, *cumulative_qty, *avg_price, false);
            }
            StreamEvent::OrderFilled {
                order_id,
                client_tag,
                cumulative_qty,
                avg_price,
            } => {
                self.on_fill(order_id, client_tag, *cumulative_qty, *avg_price, true);
            }
            StreamEvent::OrderCanceled {
                order_id,
                client_tag,
            } => {
                self.on_canceled(order_id, client_tag);
            }
            // Account state and stream-session events carry no order state;
            // the controller consumes them directly.
            StreamEvent::AccountUpdate(_) | StreamEvent::StreamExpired | StreamEvent::Resynced => {}
        }
    }

    /// Sweep for stale orders. Opening orders sitting `Open` or
    /// `PartiallyFilled` with no event activity past the threshold move to
    /// `Expired` and a cancel directive is emitted; the state only advances
    /// to `Canceled` when the exchange confirms. Closing orders are
    /// reduce-only take-profits and rest until they fill.
    pub fn expire_stale(&mut self, now: DateTime<Utc>) {
        let stale: Vec<String> = self
            .orders
            .values()
            .filter(|o| {
                o.role == OrderRole::Opening
                    && matches!(o.state, OrderState::Open | OrderState::PartiallyFilled)
                    && !o.id.is_empty()
                    && (now - o.last_update).to_std().unwrap_or_default() >= self.stale_after
            })
            .map(|o| o.client_tag.clone())
            .collect();

        for tag in stale {
            let order = self.orders.get_mut(&tag).expect("stale tag just collected");
            info!(
                "[Core] Order {} stale after {:?}, requesting cancel",
                order.id, self.stale_after
            );
            order.state = OrderState::Expired;
            order.last_update = now;
            self.decisions.push_back(Decision::CancelOrder {
                order_id: order.id.clone(),
            });
        }
    }

    /// Diff the live view against the exchange's open-orders snapshot after
    /// a stream gap (or at startup). Orders present in both are caught up on
    /// fills; snapshot orders we never placed are ignored. Returns the
    /// exchange ids of live orders missing from the snapshot; the caller
    /// resolves each with a per-order fetch and `resolve_missing`.
    pub fn reconcile(&mut self, snapshot: &[OrderSnapshot]) -> Vec<String> {
        let mut by_id: HashMap<&str, &OrderSnapshot> = HashMap::new();
        let mut by_tag: HashMap<&str, &OrderSnapshot> = HashMap::new();
        for row in snapshot {
            by_id.insert(row.order_id.as_str(), row);
            if !row.client_tag.is_empty() {
                by_tag.insert(row.client_tag.as_str(), row);
            }
        }

        let mut missing = Vec::new();
        let tags: Vec<String> = self.orders.keys().cloned().collect();
        for tag in tags {
            let order = &self.orders[&tag];
            if order.is_terminal() {
                continue;
            }
            let row = by_id
                .get(order.id.as_str())
                .or_else(|| by_tag.get(tag.as_str()))
                .copied();

            match row {
                Some(row) => {
                    // Still open on the exchange; catch up on any missed fills
                    let completes = row.executed_quantity >= row.quantity;
                    self.on_fill(
                        &row.order_id,
                        &tag,
                        row.executed_quantity,
                        row.avg_price,
                        completes,
                    );
                }
                None if order.state == OrderState::Submitting => {
                    // Placement may still be in flight; the ack or the next
                    // reconcile pass will settle it
                }
                None => missing.push(order.id.clone()),
            }
        }
        missing
    }

    /// Resolve an order that was live locally but absent from the snapshot.
    /// The exchange is the source of truth: a fetch showing the full
    /// quantity executed means `Filled`, anything else means `Canceled`.
    pub fn resolve_missing(&mut self, order_id: &str, fetched: Option<&OrderSnapshot>) {
        let Some(tag) = self.by_exchange_id.get(order_id).cloned() else {
            return;
        };
        match fetched {
            Some(row) if row.executed_quantity >= row.quantity => {
                self.on_fill(order_id, &tag, row.executed_quantity, row.avg_price, true);
            }
            Some(row) => {
                if row.executed_quantity > Decimal::ZERO {
                    self.on_fill(order_id, &tag, row.executed_quantity, row.avg_price, false);
                }
                self.on_canceled(order_id, &tag);
            }
            None => {
                // Purged server-side with nothing to recover
                self.on_canceled(order_id, &tag);
            }
        }
    }

    // --- internals ---

    /// Find the live order for an event, preferring the exchange id and
    /// falling back to the client tag (events can outrun the placement ack).
    /// Learns the id mapping as a side effect.
    fn resolve_tag(&mut self, order_id: &str, client_tag: &str) -> Option<String> {
        let tag = if let Some(tag) = self.by_exchange_id.get(order_id) {
            tag.clone()
        } else if self.orders.contains_key(client_tag) {
            client_tag.to_string()
        } else {
            debug!("[Core] Event for untracked order {} ignored", order_id);
            return None;
        };

        let order = self.orders.get_mut(&tag)?;
        if order.id.is_empty() {
            order.id = order_id.to_string();
            self.by_exchange_id.insert(order_id.to_string(), tag.clone());
        }
        Some(tag)
    }

    fn on_fill(
        &mut self,
        order_id: &str,
        client_tag: &str,
        cumulative_qty: Decimal,
        avg_price: Decimal,
        completes: bool,
    ) {
        let Some(tag) = self.resolve_tag(order_id, client_tag) else {
            return;
        };
        let order = self.orders.get_mut(&tag).expect("tag resolved");
        if order.is_terminal() {
            debug!("[Core] Fill for terminal order {} ignored", order.id);
            return;
        }

        // Cumulative fill accounting: monotone, clamped at the requested
        // quantity. Excess quantity in an event is an exchange anomaly and
        // is dropped; stale snapshots reporting less than we already applied
        // are ignored (per-order ordering only holds on the stream).
        let capped = cumulative_qty.min(order.quantity);
        if cumulative_qty > order.quantity {
            warn!(
                "[Core] Order {} reported fill {} beyond requested {}; clamping",
                order.id, cumulative_qty, order.quantity
            );
        }
        if capped > order.filled_quantity {
            order.filled_quantity = capped;
        }
        if avg_price > Decimal::ZERO {
            order.avg_fill_price = Some(avg_price);
        }
        order.last_update = Utc::now();

        // A partial fill that completes the quantity never lingers in
        // PartiallyFilled
        if completes || order.filled_quantity >= order.quantity {
            self.on_filled(&tag);
        } else if order.filled_quantity > Decimal::ZERO
            && matches!(
                order.state,
                OrderState::Submitting | OrderState::Open | OrderState::PartiallyFilled
            )
        {
            order.state = OrderState::PartiallyFilled;
        } else if order.state == OrderState::Submitting {
            // The exchange knows the order (snapshot path); the placement
            // ack is effectively delivered
            order.state = OrderState::Open;
        }
    }

    /// The order's full quantity is done. Opening orders trigger exactly one
    /// `SpawnClosingOrder`; closing orders are terminal and complete the
    /// round trip, releasing the slot.
    fn on_filled(&mut self, tag: &str) {
        let order = self.orders.get_mut(tag).expect("caller verified tag");
        match order.role {
            OrderRole::Opening => {
                if order.state != OrderState::ClosingPlaced {
                    order.state = OrderState::Filled;
                }
                if self.spawned.contains(tag) {
                    debug!(
                        "[Core] Duplicate fill for opening order {}; closing already spawned",
                        order.id
                    );
                    return;
                }
                let fill_price = order.avg_fill_price.unwrap_or(order.price);
                info!(
                    "[Core] Opening order {} filled: {} @ {}",
                    order.id, order.filled_quantity, fill_price
                );
                let decision = Decision::SpawnClosingOrder {
                    parent_id: order.id.clone(),
                    side: order.side.opposite(),
                    quantity: order.filled_quantity,
                    fill_price,
                };
                self.spawned.insert(tag.to_string());
                self.decisions.push_back(decision);
            }
            OrderRole::Closing => {
                if order.state == OrderState::Filled {
                    return; // duplicate terminal fill
                }
                order.state = OrderState::Filled;
                let closing = order.clone();
                info!(
                    "[Core] Closing order {} filled: {} @ {}",
                    closing.id,
                    closing.filled_quantity,
                    closing.avg_fill_price.unwrap_or(closing.price)
                );
                if let Some(parent_tag) = closing
                    .parent_id
                    .as_ref()
                    .and_then(|id| self.by_exchange_id.get(id))
                    .cloned()
                {
                    let pnl = self.realized_pnl(&parent_tag, &closing);
                    self.finish_round_trip(&parent_tag, &closing, pnl);
                } else {
                    // Parent already evicted (reconnect edge); still free the slot
                    self.evict(tag);
                    self.release_slot();
                    self.decisions.push_back(Decision::SlotFreed {
                        record: record_of(&closing, None, closing.parent_id.clone()),
                    });
                }
            }
        }
    }

    fn on_canceled(&mut self, order_id: &str, client_tag: &str) {
        let Some(tag) = self.resolve_tag(order_id, client_tag) else {
            return;
        };
        let order = self.orders.get_mut(&tag).expect("tag resolved");
        if order.is_terminal() {
            return;
        }
        if order.filled_quantity > Decimal::ZERO {
            // Partial fill then cancel: the residual position has no paired
            // close. The lifecycle contract emits no decision on cancel, so
            // surface it loudly instead.
            warn!(
                "[Core] Order {} canceled with partial fill {} of {}; residual position unmanaged",
                order.id, order.filled_quantity, order.quantity
            );
        }
        order.state = OrderState::Canceled;
        order.last_update = Utc::now();
        let canceled = order.clone();

        match canceled.role {
            OrderRole::Opening => {
                self.evict(&tag);
                self.release_slot();
                self.decisions.push_back(Decision::SlotFreed {
                    record: record_of(&canceled, None, None),
                });
            }
            OrderRole::Closing => {
                // Paired close canceled: the opening order is done either way
                if let Some(parent_tag) = canceled
                    .parent_id
                    .as_ref()
                    .and_then(|id| self.by_exchange_id.get(id))
                    .cloned()
                {
                    self.finish_round_trip(&parent_tag, &canceled, None);
                } else {
                    self.evict(&tag);
                    self.release_slot();
                    self.decisions.push_back(Decision::SlotFreed {
                        record: record_of(&canceled, None, canceled.parent_id.clone()),
                    });
                }
            }
        }
    }

    /// The paired closing order reached a terminal state: close the parent,
    /// free the slot, evict both, and hand the record to the sink.
    fn finish_round_trip(&mut self, parent_tag: &str, closing: &Order, pnl: Option<Decimal>) {
        let parent_id = if let Some(parent) = self.orders.get_mut(parent_tag) {
            parent.state = OrderState::Closed;
            parent.last_update = Utc::now();
            let id = parent.id.clone();
            self.evict(parent_tag);
            Some(id)
        } else {
            None
        };
        self.evict(&closing.client_tag);
        self.release_slot();
        self.decisions.push_back(Decision::SlotFreed {
            record: record_of(closing, pnl, parent_id),
        });
    }

    fn realized_pnl(&self, parent_tag: &str, closing: &Order) -> Option<Decimal> {
        if closing.state != OrderState::Filled {
            return None;
        }
        let parent = self.orders.get(parent_tag)?;
        let open_price = parent.avg_fill_price?;
        let close_price = closing.avg_fill_price?;
        let qty = closing.filled_quantity;
        let pnl = match parent.side {
            crate::types::OrderSide::Buy => (close_price - open_price) * qty,
            crate::types::OrderSide::Sell => (open_price - close_price) * qty,
        };
        Some(pnl)
    }

    fn evict(&mut self, tag: &str) {
        if let Some(order) = self.orders.remove(tag) {
            if !order.id.is_empty() {
                self.by_exchange_id.remove(&order.id);
            }
        }
    }

    fn release_slot(&mut self) {
        if self.occupied == 0 {
            error!("[Core] Slot release with zero occupied slots; accounting bug");
            return;
        }
        self.occupied -= 1;
    }
}

fn record_of(order: &Order, realized_pnl: Option<Decimal>, counter: Option<String>) -> OrderRecord {
    OrderRecord {
        order_id: if order.id.is_empty() {
            order.client_tag.clone()
        } else {
            order.id.clone()
        },
        role: order.role,
        side: order.side,
        price: order.price,
        quantity: order.quantity,
        filled_quantity: order.filled_quantity,
        realized_pnl,
        status: order.state,
        counter_order_id: counter.or_else(|| order.parent_id.clone()),
        opened_at: order.created_at,
        closed_at: order.last_update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    const STALE: Duration = Duration::from_secs(120);

    fn core(max_orders: usize) -> ReconciliationCore {
        ReconciliationCore::new(max_orders, STALE)
    }

    fn open_buy(core: &mut ReconciliationCore, tag: &str, id: &str) {
        let order = Order::new_opening(tag.to_string(), OrderSide::Buy, dec!(2500), dec!(0.01));
        assert!(core.register_opening(order));
        core.acknowledge(tag, id);
    }

    fn filled(id: &str, tag: &str, qty: Decimal, price: Decimal) -> StreamEvent {
        StreamEvent::OrderFilled {
            order_id: id.to_string(),
            client_tag: tag.to_string(),
            cumulative_qty: qty,
            avg_price: price,
        }
    }

    fn partial(id: &str, tag: &str, qty: Decimal, price: Decimal) -> StreamEvent {
        StreamEvent::OrderPartiallyFilled {
            order_id: id.to_string(),
            client_tag: tag.to_string(),
            cumulative_qty: qty,
            avg_price: price,
        }
    }

    fn canceled(id: &str, tag: &str) -> StreamEvent {
        StreamEvent::OrderCanceled {
            order_id: id.to_string(),
            client_tag: tag.to_string(),
        }
    }

    /// Register the closing order a SpawnClosingOrder decision asked for,
    /// the way the controller does after a successful placement.
    fn place_close(core: &mut ReconciliationCore, decision: &Decision, tag: &str, id: &str) {
        let Decision::SpawnClosingOrder {
            parent_id,
            side,
            quantity,
            fill_price,
        } = decision
        else {
            panic!("expected SpawnClosingOrder, got {:?}", decision);
        };
        let order = Order::new_closing(
            tag.to_string(),
            *side,
            *fill_price + dec!(1),
            *quantity,
            parent_id.clone(),
        );
        core.register_closing(order);
        core.acknowledge(tag, id);
    }

    #[test]
    fn test_fill_clamped_at_requested_quantity() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");

        c.apply(&partial("100", "t1", dec!(0.02), dec!(2500))); // beyond requested
        let order = &c.live_orders()[0];
        assert_eq!(order.filled_quantity, dec!(0.01));
    }

    #[test]
    fn test_partial_fill_completing_goes_straight_to_filled() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");

        c.apply(&partial("100", "t1", dec!(0.004), dec!(2500)));
        assert_eq!(c.live_orders()[0].state, OrderState::PartiallyFilled);

        c.apply(&partial("100", "t1", dec!(0.01), dec!(2500)));
        assert_eq!(c.live_orders()[0].state, OrderState::Filled);
        let decisions = c.drain_decisions();
        assert!(matches!(decisions[0], Decision::SpawnClosingOrder { .. }));
    }

    #[test]
    fn test_spawn_emitted_exactly_once_under_duplicate_fills() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");

        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));

        let spawns = c
            .drain_decisions()
            .into_iter()
            .filter(|d| matches!(d, Decision::SpawnClosingOrder { .. }))
            .count();
        assert_eq!(spawns, 1);
    }

    #[test]
    fn test_slot_cap_enforced() {
        let mut c = core(2);
        open_buy(&mut c, "t1", "100");
        open_buy(&mut c, "t2", "101");
        assert_eq!(c.occupied_slots(), 2);

        let refused = Order::new_opening("t3".to_string(), OrderSide::Buy, dec!(2500), dec!(0.01));
        assert!(!c.register_opening(refused));
        assert_eq!(c.occupied_slots(), 2);

        // Completing one round trip frees exactly one slot
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        let decisions = c.drain_decisions();
        place_close(&mut c, &decisions[0], "c1", "200");
        c.apply(&filled("200", "c1", dec!(0.01), dec!(2501)));
        assert_eq!(c.occupied_slots(), 1);
        assert!(c.has_capacity());
    }

    #[test]
    fn test_full_round_trip_single_slot() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");
        assert!(!c.has_capacity());

        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        let decisions = c.drain_decisions();
        assert_eq!(decisions.len(), 1);
        let Decision::SpawnClosingOrder {
            parent_id,
            side,
            quantity,
            fill_price,
        } = &decisions[0]
        else {
            panic!("expected spawn");
        };
        assert_eq!(parent_id, "100");
        assert_eq!(*side, OrderSide::Sell);
        assert_eq!(*quantity, dec!(0.01));
        assert_eq!(*fill_price, dec!(2500));

        place_close(&mut c, &decisions[0], "c1", "200");
        c.apply(&filled("200", "c1", dec!(0.01), dec!(2501)));

        let decisions = c.drain_decisions();
        assert_eq!(decisions.len(), 1);
        let Decision::SlotFreed { record } = &decisions[0] else {
            panic!("expected slot freed");
        };
        assert_eq!(record.realized_pnl, Some(dec!(0.01))); // (2501-2500)*0.01
        assert_eq!(record.counter_order_id.as_deref(), Some("100"));
        assert_eq!(c.occupied_slots(), 0);
        assert!(c.is_idle());
    }

    #[test]
    fn test_sell_direction_pnl_sign() {
        let mut c = core(1);
        let order = Order::new_opening("t1".to_string(), OrderSide::Sell, dec!(2500), dec!(0.01));
        assert!(c.register_opening(order));
        c.acknowledge("t1", "100");

        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        let decisions = c.drain_decisions();
        let Decision::SpawnClosingOrder { side, .. } = &decisions[0] else {
            panic!("expected spawn");
        };
        assert_eq!(*side, OrderSide::Buy);

        place_close(&mut c, &decisions[0], "c1", "200");
        c.apply(&filled("200", "c1", dec!(0.01), dec!(2499)));
        let Decision::SlotFreed { record } = &c.drain_decisions()[0] else {
            panic!("expected slot freed");
        };
        // Short round trip: sold 2500, bought back 2499
        assert_eq!(record.realized_pnl, Some(dec!(0.01)));
    }

    #[test]
    fn test_stale_order_cancel_flow() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");

        // Not yet stale
        c.expire_stale(Utc::now());
        assert!(c.drain_decisions().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(180);
        c.expire_stale(later);
        let decisions = c.drain_decisions();
        assert_eq!(
            decisions,
            vec![Decision::CancelOrder {
                order_id: "100".to_string()
            }]
        );
        assert_eq!(c.live_orders()[0].state, OrderState::Expired);

        // Sweep again: no duplicate cancel directive
        c.expire_stale(later + chrono::Duration::seconds(180));
        assert!(c.drain_decisions().is_empty());

        // Slot releases only on the confirmed cancel, with no closing spawned
        assert_eq!(c.occupied_slots(), 1);
        c.apply(&canceled("100", "t1"));
        let decisions = c.drain_decisions();
        assert_eq!(decisions.len(), 1);
        assert!(matches!(decisions[0], Decision::SlotFreed { .. }));
        assert_eq!(c.occupied_slots(), 0);
    }

    #[test]
    fn test_closing_orders_never_expire() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        let decisions = c.drain_decisions();
        place_close(&mut c, &decisions[0], "c1", "200");

        c.expire_stale(Utc::now() + chrono::Duration::days(1));
        assert!(c.drain_decisions().is_empty());
    }

    #[test]
    fn test_fill_event_racing_placement_ack() {
        let mut c = core(1);
        let order = Order::new_opening("t1".to_string(), OrderSide::Buy, dec!(2500), dec!(0.01));
        assert!(c.register_opening(order));

        // Fill arrives before the REST ack returns; matched by client tag
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        assert_eq!(c.live_orders()[0].state, OrderState::Filled);
        assert_eq!(c.live_orders()[0].id, "100");

        // Late ack is a no-op
        c.acknowledge("t1", "100");
        assert_eq!(c.live_orders()[0].state, OrderState::Filled);
        assert_eq!(
            c.drain_decisions()
                .iter()
                .filter(|d| matches!(d, Decision::SpawnClosingOrder { .. }))
                .count(),
            1
        );
    }

    #[test]
    fn test_rejected_placement_frees_slot() {
        let mut c = core(1);
        let order = Order::new_opening("t1".to_string(), OrderSide::Buy, dec!(2500), dec!(0.01));
        assert!(c.register_opening(order));
        assert!(!c.has_capacity());

        c.placement_failed("t1");
        assert!(c.has_capacity());
        let decisions = c.drain_decisions();
        assert!(matches!(decisions[0], Decision::SlotFreed { .. }));
    }

    #[test]
    fn test_events_for_unknown_orders_ignored() {
        let mut c = core(1);
        c.apply(&filled("999", "foreign", dec!(1), dec!(2500)));
        assert!(c.is_idle());
        assert!(c.drain_decisions().is_empty());
    }

    #[test]
    fn test_reconcile_matches_gap_free_stream() {
        // Core A sees every event; core B misses the fills during a gap and
        // recovers through snapshot reconciliation. Final views must agree.
        let mut a = core(2);
        let mut b = core(2);
        for c in [&mut a, &mut b] {
            open_buy(c, "t1", "100");
            open_buy(c, "t2", "101");
        }

        // Gap-free stream: t1 fills completely, t2 fills halfway
        a.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        a.apply(&partial("101", "t2", dec!(0.005), dec!(2499)));

        // Core B reconnects and reconciles instead. t1 is gone from the
        // open-orders snapshot (it filled); t2 is still open with progress.
        let open_snapshot = vec![OrderSnapshot {
            order_id: "101".to_string(),
            client_tag: "t2".to_string(),
            side: OrderSide::Buy,
            price: dec!(2500),
            quantity: dec!(0.01),
            executed_quantity: dec!(0.005),
            avg_price: dec!(2499),
        }];
        let missing = b.reconcile(&open_snapshot);
        assert_eq!(missing, vec!["100".to_string()]);
        b.resolve_missing(
            "100",
            Some(&OrderSnapshot {
                order_id: "100".to_string(),
                client_tag: "t1".to_string(),
                side: OrderSide::Buy,
                price: dec!(2500),
                quantity: dec!(0.01),
                executed_quantity: dec!(0.01),
                avg_price: dec!(2500),
            }),
        );

        let view = |c: &ReconciliationCore| {
            let mut orders: Vec<(String, OrderState, Decimal)> = c
                .live_orders()
                .iter()
                .map(|o| (o.id.clone(), o.state, o.filled_quantity))
                .collect();
            orders.sort();
            (orders, c.occupied_slots())
        };
        assert_eq!(view(&a), view(&b));

        // Both emitted exactly one spawn for t1
        for c in [&mut a, &mut b] {
            let spawns = c
                .drain_decisions()
                .into_iter()
                .filter(|d| matches!(d, Decision::SpawnClosingOrder { .. }))
                .count();
            assert_eq!(spawns, 1);
        }
    }

    #[test]
    fn test_reconcile_resolves_vanished_order_as_canceled() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");

        let missing = c.reconcile(&[]);
        assert_eq!(missing, vec!["100".to_string()]);

        // Per-order fetch shows nothing executed
        c.resolve_missing(
            "100",
            Some(&OrderSnapshot {
                order_id: "100".to_string(),
                client_tag: "t1".to_string(),
                side: OrderSide::Buy,
                price: dec!(2500),
                quantity: dec!(0.01),
                executed_quantity: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            }),
        );
        assert!(c.is_idle());
        assert_eq!(c.occupied_slots(), 0);
        let decisions = c.drain_decisions();
        assert!(matches!(decisions[0], Decision::SlotFreed { .. }));
    }

    #[test]
    fn test_reconcile_ignores_foreign_snapshot_orders() {
        let mut c = core(1);
        let snapshot = vec![OrderSnapshot {
            order_id: "777".to_string(),
            client_tag: "someone-else".to_string(),
            side: OrderSide::Sell,
            price: dec!(3000),
            quantity: dec!(1),
            executed_quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }];
        assert!(c.reconcile(&snapshot).is_empty());
        assert!(c.is_idle());
    }

    #[test]
    fn test_closing_cancel_closes_round_trip_without_pnl() {
        let mut c = core(1);
        open_buy(&mut c, "t1", "100");
        c.apply(&filled("100", "t1", dec!(0.01), dec!(2500)));
        let decisions = c.drain_decisions();
        place_close(&mut c, &decisions[0], "c1", "200");

        c.apply(&canceled("200", "c1"));
        let decisions = c.drain_decisions();
        let Decision::SlotFreed { record } = &decisions[0] else {
            panic!("expected slot freed");
        };
        assert_eq!(record.realized_pnl, None);
        assert_eq!(record.status, OrderState::Canceled);
        assert_eq!(c.occupied_slots(), 0);
        assert!(c.is_idle());
    }

    #[test]
    fn test_shutdown_cancellable_ids() {
        let mut c = core(3);
        open_buy(&mut c, "t1", "100");
        open_buy(&mut c, "t2", "101");
        c.apply(&partial("101", "t2", dec!(0.004), dec!(2500)));
        // A filled order is not cancellable
        open_buy(&mut c, "t3", "102");
        c.apply(&filled("102", "t3", dec!(0.01), dec!(2500)));

        let mut ids = c.cancellable_order_ids();
        ids.sort();
        assert_eq!(ids, vec!["100".to_string(), "101".to_string()]);
    }
}

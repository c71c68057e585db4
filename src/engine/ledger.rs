//! Inventory ledger: on-hand and reserved stock per part.
//!
//! Every method keeps `reserved <= on_hand`. A work order holds at most one
//! active reservation per part; reserving again adjusts that reservation.

use ulid::Ulid;

use crate::limits::MAX_STOCK_HISTORY;
use crate::model::*;

use super::EngineError;

impl PartState {
    /// Stock not claimed by any active reservation.
    pub fn available(&self) -> Qty {
        self.on_hand - self.reserved
    }

    /// Quantity held by Committed reservations.
    pub fn committed(&self) -> Qty {
        self.active
            .values()
            .filter_map(|rid| self.reservations.get(rid))
            .filter(|r| r.state == ReservationState::Committed)
            .map(|r| r.quantity)
            .sum()
    }

    pub fn is_low_stock(&self) -> bool {
        self.available() < self.minimum_threshold
    }

    /// The active reservation `job_id` holds on this part, if any.
    pub fn active_for(&self, job_id: &Ulid) -> Option<&Reservation> {
        self.active.get(job_id).and_then(|rid| self.reservations.get(rid))
    }

    /// Hold `qty` for `job_id`. Succeeds iff stock not held by other jobs
    /// covers `qty`. Returns the id of the job's reservation, which is
    /// `new_id` unless the job already had one on this part.
    pub fn reserve(&mut self, job_id: Ulid, qty: Qty, new_id: Ulid) -> Result<Ulid, EngineError> {
        if qty == 0 {
            return Err(EngineError::InvalidRequest("reservation quantity must be positive"));
        }
        let existing = self.active_for(&job_id).cloned();
        let own = existing.as_ref().map_or(0, |r| r.quantity);
        let free = self.on_hand - (self.reserved - own);
        if let Some(r) = &existing
            && r.state == ReservationState::Committed
        {
            if r.quantity == qty {
                return Ok(r.id);
            }
            return Err(EngineError::InvalidState {
                reservation_id: r.id,
                state: r.state,
            });
        }
        if free < qty {
            return Err(EngineError::InsufficientStock {
                part_id: self.id,
                requested: qty,
                available: free,
            });
        }

        self.reserved = self.reserved - own + qty;
        match existing {
            Some(r) => {
                if let Some(held) = self.reservations.get_mut(&r.id) {
                    held.quantity = qty;
                }
                Ok(r.id)
            }
            None => {
                if self.reservations.contains_key(&new_id) {
                    return Err(EngineError::AlreadyExists(new_id));
                }
                self.reservations.insert(
                    new_id,
                    Reservation {
                        id: new_id,
                        job_id,
                        part_id: self.id,
                        quantity: qty,
                        state: ReservationState::Held,
                    },
                );
                self.active.insert(job_id, new_id);
                Ok(new_id)
            }
        }
    }

    /// Held → Committed.
    pub fn commit(&mut self, reservation_id: Ulid) -> Result<(), EngineError> {
        let r = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if r.state != ReservationState::Held {
            return Err(EngineError::InvalidState {
                reservation_id,
                state: r.state,
            });
        }
        r.state = ReservationState::Committed;
        Ok(())
    }

    /// Held or Committed → Released, returning the stock. Releasing a
    /// Released reservation is a no-op; returns whether anything changed.
    pub fn release(&mut self, reservation_id: Ulid) -> Result<bool, EngineError> {
        let r = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        match r.state {
            ReservationState::Released => Ok(false),
            ReservationState::Consumed => Err(EngineError::InvalidState {
                reservation_id,
                state: r.state,
            }),
            ReservationState::Held | ReservationState::Committed => {
                r.state = ReservationState::Released;
                self.reserved -= r.quantity;
                let job_id = r.job_id;
                self.active.remove(&job_id);
                Ok(true)
            }
        }
    }

    /// Forget Released and Consumed reservations that `keep` rejects.
    /// Active reservations always stay. Returns the ids dropped.
    pub fn prune_reservations(&mut self, keep: impl Fn(&Reservation) -> bool) -> Vec<Ulid> {
        let dropped: Vec<Ulid> = self
            .reservations
            .values()
            .filter(|r| !r.state.is_active() && !keep(r))
            .map(|r| r.id)
            .collect();
        for id in &dropped {
            self.reservations.remove(id);
        }
        dropped
    }

    /// Committed → Consumed: the quantity leaves both reserved and on-hand.
    pub fn consume(&mut self, reservation_id: Ulid, at: Ms) -> Result<(), EngineError> {
        let r = self
            .reservations
            .get_mut(&reservation_id)
            .ok_or(EngineError::NotFound(reservation_id))?;
        if r.state != ReservationState::Committed {
            return Err(EngineError::InvalidState {
                reservation_id,
                state: r.state,
            });
        }
        r.state = ReservationState::Consumed;
        let (qty, job_id) = (r.quantity, r.job_id);
        self.reserved -= qty;
        self.on_hand -= qty;
        self.active.remove(&job_id);
        self.record(StockMovement {
            at,
            kind: MovementKind::Issued,
            quantity: qty,
            job_id: Some(job_id),
            remarks: None,
        });
        Ok(())
    }

    /// Receive (`delta > 0`) or write off (`delta < 0`) stock. Fails with
    /// `WouldUnderflow` rather than drop on-hand below what is reserved.
    pub fn adjust_on_hand(
        &mut self,
        delta: i64,
        remarks: Option<String>,
        at: Ms,
    ) -> Result<(), EngineError> {
        if delta == 0 {
            return Ok(());
        }
        let next = i64::from(self.on_hand) + delta;
        if next < i64::from(self.reserved) {
            return Err(EngineError::WouldUnderflow {
                part_id: self.id,
                on_hand: self.on_hand,
                reserved: self.reserved,
                delta,
            });
        }
        self.on_hand = Qty::try_from(next)
            .map_err(|_| EngineError::LimitExceeded("on-hand quantity too large"))?;
        let kind = if delta > 0 {
            MovementKind::Received
        } else {
            MovementKind::WrittenOff
        };
        self.record(StockMovement {
            at,
            kind,
            quantity: delta.unsigned_abs() as Qty,
            job_id: None,
            remarks,
        });
        Ok(())
    }

    fn record(&mut self, movement: StockMovement) {
        if self.movements.len() >= MAX_STOCK_HISTORY {
            self.movements.pop_front();
        }
        self.movements.push_back(movement);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(on_hand: Qty) -> PartState {
        PartState::new(Ulid::new(), "Brake pad".into(), Unit::Set, on_hand, 2)
    }

    #[test]
    fn reserve_all_then_second_job_is_short() {
        let mut p = part(5);
        let (a, b) = (Ulid::new(), Ulid::new());
        p.reserve(a, 5, Ulid::new()).unwrap();

        let err = p.reserve(b, 1, Ulid::new()).unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientStock {
                part_id: p.id,
                requested: 1,
                available: 0,
            }
        );
        assert_eq!(p.on_hand, 5);
        assert_eq!(p.reserved, 5);
    }

    #[test]
    fn re_reserve_adjusts_existing() {
        let mut p = part(10);
        let job = Ulid::new();
        let first = p.reserve(job, 4, Ulid::new()).unwrap();
        let second = p.reserve(job, 7, Ulid::new()).unwrap();
        assert_eq!(first, second);
        assert_eq!(p.reserved, 7);
        assert_eq!(p.reservations.len(), 1);
        assert_eq!(p.active_for(&job).map(|r| r.quantity), Some(7));
    }

    #[test]
    fn re_reserve_excludes_own_quantity_from_check() {
        let mut p = part(5);
        let job = Ulid::new();
        p.reserve(job, 5, Ulid::new()).unwrap();
        assert!(p.reserve(job, 5, Ulid::new()).is_ok());
        assert!(p.reserve(job, 6, Ulid::new()).is_err());
        assert_eq!(p.reserved, 5);
    }

    #[test]
    fn zero_quantity_rejected() {
        let mut p = part(5);
        assert!(matches!(
            p.reserve(Ulid::new(), 0, Ulid::new()),
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[test]
    fn commit_requires_held() {
        let mut p = part(5);
        let rid = p.reserve(Ulid::new(), 2, Ulid::new()).unwrap();
        p.commit(rid).unwrap();
        assert_eq!(p.committed(), 2);
        assert_eq!(
            p.commit(rid),
            Err(EngineError::InvalidState {
                reservation_id: rid,
                state: ReservationState::Committed,
            })
        );
        assert!(matches!(p.commit(Ulid::new()), Err(EngineError::NotFound(_))));
    }

    #[test]
    fn release_is_idempotent_and_returns_stock() {
        let mut p = part(5);
        let rid = p.reserve(Ulid::new(), 3, Ulid::new()).unwrap();
        p.commit(rid).unwrap();
        assert_eq!(p.available(), 2);
        assert_eq!(p.release(rid), Ok(true));
        assert_eq!(p.available(), 5);
        assert_eq!(p.release(rid), Ok(false));
        assert_eq!(p.reserved, 0);
    }

    #[test]
    fn prune_drops_only_finished_reservations() {
        let mut p = part(10);
        let (done, live) = (Ulid::new(), Ulid::new());
        let released = p.reserve(done, 2, Ulid::new()).unwrap();
        p.release(released).unwrap();
        let held = p.reserve(live, 3, Ulid::new()).unwrap();

        let dropped = p.prune_reservations(|_| false);
        assert_eq!(dropped, vec![released]);
        assert!(p.reservations.contains_key(&held));
        assert_eq!(p.reserved, 3);
        assert!(p.prune_reservations(|_| false).is_empty());
    }

    #[test]
    fn released_job_gets_fresh_reservation() {
        let mut p = part(5);
        let job = Ulid::new();
        let first = p.reserve(job, 2, Ulid::new()).unwrap();
        p.release(first).unwrap();
        let second = p.reserve(job, 2, Ulid::new()).unwrap();
        assert_ne!(first, second);
        assert_eq!(p.reserved, 2);
    }

    #[test]
    fn consume_leaves_shelf() {
        let mut p = part(5);
        let job = Ulid::new();
        let rid = p.reserve(job, 3, Ulid::new()).unwrap();
        assert!(p.consume(rid, 10).is_err());
        p.commit(rid).unwrap();
        p.consume(rid, 10).unwrap();
        assert_eq!(p.on_hand, 2);
        assert_eq!(p.reserved, 0);
        assert!(p.active_for(&job).is_none());
        assert_eq!(p.movements.back().map(|m| m.kind), Some(MovementKind::Issued));
        assert!(p.release(rid).is_err());
    }

    #[test]
    fn adjust_on_hand_guards_reserved() {
        let mut p = part(5);
        p.reserve(Ulid::new(), 3, Ulid::new()).unwrap();
        let err = p.adjust_on_hand(-3, None, 0).unwrap_err();
        assert!(matches!(err, EngineError::WouldUnderflow { .. }));
        assert_eq!(p.on_hand, 5);

        p.adjust_on_hand(-2, Some("damaged".into()), 0).unwrap();
        assert_eq!(p.on_hand, 3);
        assert_eq!(p.available(), 0);
        p.adjust_on_hand(10, None, 1).unwrap();
        assert_eq!(p.on_hand, 13);
        let kinds: Vec<MovementKind> = p.movements.iter().map(|m| m.kind).collect();
        assert_eq!(kinds, vec![MovementKind::WrittenOff, MovementKind::Received]);
    }

    #[test]
    fn history_is_bounded() {
        let mut p = part(0);
        for i in 0..(MAX_STOCK_HISTORY as i64 + 10) {
            p.adjust_on_hand(1, None, i).unwrap();
        }
        assert_eq!(p.movements.len(), MAX_STOCK_HISTORY);
        assert_eq!(p.movements.front().map(|m| m.at), Some(10));
    }

    #[test]
    fn low_stock_uses_available() {
        let mut p = part(3);
        assert!(!p.is_low_stock());
        p.reserve(Ulid::new(), 2, Ulid::new()).unwrap();
        assert!(p.is_low_stock());
    }
}

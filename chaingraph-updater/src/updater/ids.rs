//! Dense, monotone id allocation for addresses, clusters and transactions.
//!
//! The allocator owns the in-memory counters seeded from the persisted
//! high-water marks; the coordinator is its only user, so counters advance
//! strictly within one batch and are only persisted with the status row.

use std::collections::HashMap;

use chaingraph_common::{Address, AddressId, ClusterId, TxId};
use tracing::debug;

use crate::updater::UpdateError;

/// Synthetic input address credited for coinbase transactions.
pub const COINBASE_PSEUDO_ADDRESS: &[u8] = b"coinbase";

/// Pinned id of the coinbase pseudo-address.
pub const COINBASE_PSEUDO_ADDRESS_ID: AddressId = 0;

/// Sentinel for outputs whose script resolves to no address.
pub const NONSTANDARD_PSEUDO_ADDRESS: &[u8] = b"nonstandard";

pub struct IdAllocator {
    next_address_id: AddressId,
    next_cluster_id: ClusterId,
    next_tx_id: TxId,
}

impl IdAllocator {
    /// Seeds the counters from the persisted high-water marks. Id 0 is
    /// reserved for the coinbase pseudo-address even in empty keyspaces.
    pub fn new(
        highest_address_id: Option<AddressId>,
        highest_cluster_id: Option<ClusterId>,
        highest_tx_id: Option<TxId>,
    ) -> Self {
        Self {
            next_address_id: highest_address_id.unwrap_or(COINBASE_PSEUDO_ADDRESS_ID) + 1,
            next_cluster_id: highest_cluster_id.unwrap_or(0) + 1,
            next_tx_id: highest_tx_id.map(|id| id + 1).unwrap_or(0),
        }
    }

    /// Highest address id handed out so far; persisted with the status row.
    pub fn highest_address_id(&self) -> AddressId {
        self.next_address_id - 1
    }

    pub fn highest_cluster_id(&self) -> ClusterId {
        self.next_cluster_id - 1
    }

    pub fn consume_address_id(&mut self) -> AddressId {
        let id = self.next_address_id;
        self.next_address_id += 1;
        id
    }

    pub fn consume_cluster_id(&mut self) -> ClusterId {
        let id = self.next_cluster_id;
        self.next_cluster_id += 1;
        id
    }

    pub fn consume_transaction_id(&mut self) -> TxId {
        let id = self.next_tx_id;
        self.next_tx_id += 1;
        id
    }

    /// Advances the counter past an id observed in the store. Keeps the
    /// high-water mark correct when a crashed batch is replayed: its rows
    /// exist, but the status row never recorded their ids.
    pub fn observe_address_id(&mut self, id: AddressId) {
        if id >= self.next_address_id {
            self.next_address_id = id + 1;
        }
    }

    pub fn observe_cluster_id(&mut self, id: ClusterId) {
        if id >= self.next_cluster_id {
            self.next_cluster_id = id + 1;
        }
    }

    pub fn observe_transaction_id(&mut self, id: TxId) {
        if id >= self.next_tx_id {
            self.next_tx_id = id + 1;
        }
    }

    /// Resolves every address in `ordered` to an id: known addresses keep
    /// their stored id, unknown ones draw fresh ids in input order. The
    /// order therefore is the observable tie-break rule and mirrors
    /// `(block, tx position, in/output position)` of first sighting.
    pub fn assign_address_ids(
        &mut self,
        ordered: &[Address],
        existing: &HashMap<Address, AddressId>,
    ) -> Result<HashMap<Address, AddressId>, UpdateError> {
        let mut assigned: HashMap<Address, AddressId> = HashMap::with_capacity(ordered.len());
        let mut new_count = 0usize;
        for address in ordered {
            if assigned.contains_key(address) {
                return Err(UpdateError::InvariantViolation(format!(
                    "duplicate address in assignment order: {}",
                    hex::encode(address)
                )));
            }
            let id = if address.as_slice() == COINBASE_PSEUDO_ADDRESS {
                COINBASE_PSEUDO_ADDRESS_ID
            } else if let Some(id) = existing.get(address) {
                self.observe_address_id(*id);
                *id
            } else {
                new_count += 1;
                self.consume_address_id()
            };
            assigned.insert(address.clone(), id);
        }
        debug!(total = ordered.len(), new = new_count, "Assigned address ids");
        Ok(assigned)
    }

    /// Dense ids for account transactions, keyed by hash. New hashes draw
    /// ids in the given (block, within-block) order.
    pub fn assign_transaction_ids(
        &mut self,
        hashes_in_order: &[Vec<u8>],
        existing: &HashMap<Vec<u8>, TxId>,
    ) -> HashMap<Vec<u8>, TxId> {
        let mut assigned = HashMap::with_capacity(hashes_in_order.len());
        for hash in hashes_in_order {
            if assigned.contains_key(hash) {
                continue;
            }
            let id = match existing.get(hash) {
                Some(id) => {
                    self.observe_transaction_id(*id);
                    *id
                }
                None => self.consume_transaction_id(),
            };
            assigned.insert(hash.clone(), id);
        }
        assigned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Address {
        s.as_bytes().to_vec()
    }

    #[test]
    fn ids_are_dense_and_monotone() {
        let mut allocator = IdAllocator::new(None, None, None);
        let ordered = vec![addr("a"), addr("b"), addr("c")];
        let assigned = allocator
            .assign_address_ids(&ordered, &HashMap::new())
            .unwrap();
        assert_eq!(assigned[&addr("a")], 1);
        assert_eq!(assigned[&addr("b")], 2);
        assert_eq!(assigned[&addr("c")], 3);
        assert_eq!(allocator.highest_address_id(), 3);
    }

    #[test]
    fn existing_addresses_keep_their_ids() {
        let mut allocator = IdAllocator::new(Some(41), None, None);
        let existing = HashMap::from([(addr("known"), 7)]);
        let assigned = allocator
            .assign_address_ids(&[addr("known"), addr("fresh")], &existing)
            .unwrap();
        assert_eq!(assigned[&addr("known")], 7);
        assert_eq!(assigned[&addr("fresh")], 42);
    }

    #[test]
    fn coinbase_is_pinned_to_zero() {
        let mut allocator = IdAllocator::new(Some(10), None, None);
        let assigned = allocator
            .assign_address_ids(&[COINBASE_PSEUDO_ADDRESS.to_vec()], &HashMap::new())
            .unwrap();
        assert_eq!(assigned[&COINBASE_PSEUDO_ADDRESS.to_vec()], 0);
        // pinned ids never advance the counter
        assert_eq!(allocator.highest_address_id(), 10);
    }

    #[test]
    fn duplicate_input_is_an_invariant_violation() {
        let mut allocator = IdAllocator::new(None, None, None);
        let result = allocator.assign_address_ids(&[addr("x"), addr("x")], &HashMap::new());
        assert!(matches!(result, Err(UpdateError::InvariantViolation(_))));
    }

    #[test]
    fn transaction_ids_resume_from_high_water_mark() {
        let mut allocator = IdAllocator::new(None, None, Some(99));
        let assigned = allocator.assign_transaction_ids(
            &[vec![0xaa], vec![0xbb], vec![0xaa]],
            &HashMap::from([(vec![0xbb], 7)]),
        );
        assert_eq!(assigned[&vec![0xaau8]], 100);
        assert_eq!(assigned[&vec![0xbbu8]], 7);
    }
}

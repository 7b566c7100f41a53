//! Coordination-free id assignment.
//!
//! Ids are split into S residue classes ("stripes"). A node only ever hands
//! out ids `≡ stripe (mod S)` for stripes it owns, so two nodes with disjoint
//! stripes cannot collide even while partitioned.
//!
//! ```text
//! S = 4, node owns {1, 3}
//!
//!   stripe 1: 1, 5, 9, 13, ...
//!   stripe 3: 3, 7, 11, 15, ...
//!   assign(): 1, 3, 5, 7, 9, ...   (round-robin across owned stripes)
//! ```
//!
//! At startup each table is seeded with the ids already stored for it; the
//! highest id per owned stripe becomes that stripe's last value. A stripe with
//! no stored id starts at its bare value.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;

use crate::{cluster::ClusterMap, error::ClusterError};

#[derive(Debug, Clone, Copy)]
struct Stripe {
    stripe: u32,
    last: Option<u64>,
}

/// Per-table stripe counters.
#[derive(Debug, Clone)]
pub struct StripeTable {
    stripe_count: u64,
    stripes: Vec<Stripe>,
    cursor: usize,
}

impl StripeTable {
    /// Table over the owned `stripes` of `stripe_count`.
    pub fn new(stripe_count: u32, stripes: &[u32]) -> Result<Self, ClusterError> {
        if stripe_count == 0 {
            return Err(ClusterError::ZeroStripeCount);
        }
        if stripes.is_empty() {
            return Err(ClusterError::NoStripes);
        }
        if let Some(&stripe) = stripes.iter().find(|&&s| s >= stripe_count) {
            return Err(ClusterError::StripeOutOfRange { stripe, stripe_count });
        }

        let mut owned = stripes.to_vec();
        owned.sort_unstable();
        owned.dedup();

        Ok(Self {
            stripe_count: u64::from(stripe_count),
            stripes: owned.into_iter().map(|stripe| Stripe { stripe, last: None }).collect(),
            cursor: 0,
        })
    }

    /// Note an existing id; ids outside the owned stripes are ignored.
    pub fn observe(&mut self, id: u64) {
        let residue = (id % self.stripe_count) as u32;
        if let Some(entry) = self.stripes.iter_mut().find(|s| s.stripe == residue) {
            entry.last = Some(entry.last.map_or(id, |last| last.max(id)));
        }
    }

    /// Observe every id in `ids`.
    pub fn seed(&mut self, ids: impl IntoIterator<Item = u64>) {
        for id in ids {
            self.observe(id);
        }
    }

    /// Next id, round-robin across owned stripes.
    pub fn assign(&mut self) -> Result<u64, ClusterError> {
        let index = self.cursor % self.stripes.len();
        self.cursor = (index + 1) % self.stripes.len();

        let entry = &mut self.stripes[index];
        let next = match entry.last {
            None => u64::from(entry.stripe),
            Some(last) => last.checked_add(self.stripe_count).ok_or(ClusterError::IdSpaceExhausted(entry.stripe))?,
        };
        entry.last = Some(next);
        Ok(next)
    }

    /// Highest id handed out or observed in `stripe`.
    pub fn last(&self, stripe: u32) -> Option<u64> {
        self.stripes.iter().find(|s| s.stripe == stripe).and_then(|s| s.last)
    }
}

/// Thread-safe assigner over many data tables.
///
/// The table map lock is held only to find or create a table's counters;
/// assignment then runs under that table's own lock.
#[derive(Debug)]
pub struct IdAssigner {
    template: StripeTable,
    tables: Mutex<HashMap<String, Arc<Mutex<StripeTable>>>>,
}

impl IdAssigner {
    /// Assigner over the given owned stripes.
    pub fn new(stripe_count: u32, stripes: &[u32]) -> Result<Self, ClusterError> {
        Ok(Self { template: StripeTable::new(stripe_count, stripes)?, tables: Mutex::new(HashMap::new()) })
    }

    /// Assigner for the stripes `node_id` owns in `map`.
    pub fn for_node(map: &ClusterMap, node_id: u32) -> Result<Self, ClusterError> {
        let node = map.require(node_id)?;
        Self::new(map.stripe_count(), &node.stripes)
    }

    fn table(&self, name: &str) -> Arc<Mutex<StripeTable>> {
        let mut tables = self.tables.lock();
        if let Some(table) = tables.get(name) {
            return Arc::clone(table);
        }
        let table = Arc::new(Mutex::new(self.template.clone()));
        tables.insert(name.to_owned(), Arc::clone(&table));
        table
    }

    /// Seed `table` with ids already stored in it.
    pub fn seed(&self, table: &str, ids: impl IntoIterator<Item = u64>) {
        self.table(table).lock().seed(ids);
    }

    /// Note one existing id of `table`.
    pub fn observe(&self, table: &str, id: u64) {
        self.table(table).lock().observe(id);
    }

    /// Next id for `table`.
    pub fn assign(&self, table: &str) -> Result<u64, ClusterError> {
        let id = self.table(table).lock().assign()?;
        tracing::trace!(table, id, "assigned id");
        Ok(id)
    }

    /// Stripe count S.
    pub fn stripe_count(&self) -> u32 {
        self.template.stripe_count as u32
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, thread};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn unused_stripes_start_at_bare_value() {
        let mut table = StripeTable::new(4, &[3, 1]).unwrap();
        let ids: Vec<u64> = (0..5).map(|_| table.assign().unwrap()).collect();
        assert_eq!(ids, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn seeding_takes_highest_per_stripe() {
        let mut table = StripeTable::new(4, &[1, 2]).unwrap();
        table.seed([1, 5, 21, 9, 2, 6, 100, 3]);
        assert_eq!(table.last(1), Some(21));
        assert_eq!(table.last(2), Some(6));
        assert_eq!(table.assign().unwrap(), 25);
        assert_eq!(table.assign().unwrap(), 10);
    }

    #[test]
    fn overflow_is_an_error() {
        let mut table = StripeTable::new(4, &[3]).unwrap();
        table.observe(u64::MAX);
        assert_eq!(table.assign(), Err(ClusterError::IdSpaceExhausted(3)));
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        assert!(matches!(StripeTable::new(4, &[]), Err(ClusterError::NoStripes)));
        assert!(matches!(StripeTable::new(4, &[4]), Err(ClusterError::StripeOutOfRange { .. })));
    }

    #[test]
    fn concurrent_assignment_is_unique() {
        let assigner = Arc::new(IdAssigner::new(8, &[0, 5]).unwrap());
        assigner.seed("pages", [5, 13, 40]);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let assigner = Arc::clone(&assigner);
                thread::spawn(move || (0..250).map(|_| assigner.assign("pages").unwrap()).collect::<Vec<_>>())
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(id > 13 || id == 0);
                assert!(matches!(id % 8, 0 | 5));
                assert!(seen.insert(id), "duplicate id {id}");
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn tables_are_independent() {
        let assigner = IdAssigner::new(2, &[1]).unwrap();
        assert_eq!(assigner.assign("a").unwrap(), 1);
        assert_eq!(assigner.assign("a").unwrap(), 3);
        assert_eq!(assigner.assign("b").unwrap(), 1);
    }

    proptest! {
        #[test]
        fn disjoint_nodes_never_collide(
            stripe_count in 1u32..16,
            split in any::<u16>(),
            existing in proptest::collection::vec(0u64..10_000, 0..40),
            rounds in 1usize..60,
        ) {
            // Deal stripes to two nodes by bit mask.
            let (a, b): (Vec<u32>, Vec<u32>) = (0..stripe_count).partition(|s| split & (1 << s) != 0);
            prop_assume!(!a.is_empty() && !b.is_empty());

            let mut ids = HashSet::new();
            for owned in [&a, &b] {
                let mut table = StripeTable::new(stripe_count, owned).unwrap();
                table.seed(existing.iter().copied());
                for _ in 0..rounds {
                    let id = table.assign().unwrap();
                    prop_assert!(owned.contains(&((id % u64::from(stripe_count)) as u32)));
                    prop_assert!(!existing.contains(&id));
                    prop_assert!(ids.insert(id));
                }
            }
        }
    }
}

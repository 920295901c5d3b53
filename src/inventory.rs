//! The last published view of running containers, and the membership diff
//! that decides how much work a reconciliation pass has to do.

use indexmap::IndexMap;

use crate::types::ContainerRecord;

/// Records keyed by container id, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    records: IndexMap<String, ContainerRecord>,
}

/// Result of comparing the inventory against the live container set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Running but not yet resolved.
    pub new_ids: Vec<String>,
    /// Resolved earlier but no longer running.
    pub missing_ids: Vec<String>,
    /// Present on both sides; their cached records are reused.
    pub unchanged: Vec<String>,
}

impl MembershipDiff {
    /// Set-based comparison. `live` must be sorted and deduplicated, which
    /// makes every output list sorted as well.
    pub fn between<'a>(known: impl IntoIterator<Item = &'a str>, live: &[String]) -> Self {
        let mut known: Vec<&str> = known.into_iter().collect();
        known.sort_unstable();

        let mut diff = Self::default();
        for id in live {
            if known.binary_search(&id.as_str()).is_ok() {
                diff.unchanged.push(id.clone());
            } else {
                diff.new_ids.push(id.clone());
            }
        }
        diff.missing_ids = known
            .into_iter()
            .filter(|id| live.binary_search_by(|l| l.as_str().cmp(*id)).is_err())
            .map(String::from)
            .collect();
        diff
    }

    pub fn is_unchanged(&self) -> bool {
        self.new_ids.is_empty() && self.missing_ids.is_empty()
    }
}

impl Inventory {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&ContainerRecord> {
        self.records.get(id)
    }

    pub fn insert(&mut self, record: ContainerRecord) {
        self.records.insert(record.id.clone(), record);
    }

    pub fn records(&self) -> impl Iterator<Item = &ContainerRecord> {
        self.records.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.records.keys().map(String::as_str)
    }

    pub fn diff(&self, live: &[String]) -> MembershipDiff {
        MembershipDiff::between(self.ids(), live)
    }

    /// Builds the next inventory: cached records for ids still running (in
    /// their previous order), followed by the freshly resolved ones. Records
    /// for missing ids are dropped.
    pub fn rebuild(&self, diff: &MembershipDiff, resolved: Vec<ContainerRecord>) -> Inventory {
        let mut next = Inventory::default();
        for record in self.records() {
            if diff.unchanged.binary_search(&record.id).is_ok() {
                next.insert(record.clone());
            }
        }
        for record in resolved {
            next.insert(record);
        }
        next
    }
}

impl FromIterator<ContainerRecord> for Inventory {
    fn from_iter<T: IntoIterator<Item = ContainerRecord>>(iter: T) -> Self {
        let mut inventory = Inventory::default();
        for record in iter {
            inventory.insert(record);
        }
        inventory
    }
}

use std::path::Path;

use hashbrown::HashSet;

use crate::{
    record::{KeySpec, RecordIdentifier},
    table,
};

/// Identifiers already captured, rebuilt from the output file at every start.
#[derive(Debug, Default)]
pub struct DedupLedger {
    seen: HashSet<RecordIdentifier>,
}

impl DedupLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preloads every row of `output`. An absent or unreadable file yields an
    /// empty ledger.
    pub fn bootstrap(output: &Path, key: &KeySpec) -> Self {
        let mut ledger = Self::new();
        match table::read(output) {
            Ok(Some(t)) if key.covered_by(&t.header) => {
                ledger
                    .seen
                    .extend(t.rows.iter().map(|row| key.identify_row(&t.header, row)));
                tracing::info!(target: "ledger", "preloaded {} identifiers from {}", ledger.len(), output.display());
            }
            Ok(Some(_)) => {
                tracing::warn!(target: "ledger", "{} lacks key columns, ledger starts empty", output.display());
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(target: "ledger", "cannot read {}: {err}, ledger starts empty", output.display());
            }
        }
        ledger
    }

    pub fn contains(&self, id: &RecordIdentifier) -> bool {
        self.seen.contains(id)
    }

    /// Returns `true` if `id` was new.
    pub fn add(&mut self, id: RecordIdentifier) -> bool {
        self.seen.insert(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::{
    record::{KeySpec, Record, RecordIdentifier},
    table::{self, Table},
};

/// Buffers records and merges them into the output CSV on flush.
#[derive(Debug)]
pub struct RecordSink {
    path: PathBuf,
    key: KeySpec,
    buffer: Vec<Record>,
}

impl RecordSink {
    pub fn new(path: impl Into<PathBuf>, key: KeySpec) -> Self {
        Self {
            path: path.into(),
            key,
            buffer: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn buffer(&mut self, record: Record) {
        self.buffer.push(record);
    }

    pub const fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Read, merge, dedup (last wins) and rewrite the output. Returns the
    /// number of rows now on disk. The buffer survives a failed write.
    pub fn flush(&mut self) -> anyhow::Result<usize> {
        if self.buffer.is_empty() {
            return Ok(0);
        }

        let merged = match table::read(&self.path) {
            Ok(Some(existing)) if self.key.covered_by(&existing.header) => {
                Some(self.merge(existing))
            }
            Ok(Some(_)) => {
                tracing::warn!(target: "sink", "{} lacks key columns, rewriting with new records only", self.path.display());
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(target: "sink", "cannot merge with {}: {err}, rewriting with new records only", self.path.display());
                None
            }
        };
        let fresh = merged.is_none();
        let table = merged.unwrap_or_else(|| self.merge(Table::default()));

        table::write(&self.path, &table)?;

        let n_new = self.buffer.len();
        self.buffer.clear();
        if fresh {
            tracing::info!(target: "sink", "\x1b[36mcreated {} with {} records\x1b[0m", self.path.display(), table.rows.len());
        } else {
            tracing::info!(target: "sink", "\x1b[36mappended {n_new} records to {}, total {}\x1b[0m", self.path.display(), table.rows.len());
        }
        Ok(table.rows.len())
    }

    fn merge(&self, mut table: Table) -> Table {
        for record in &self.buffer {
            let mut row = vec![String::new(); table.header.len()];
            for (name, value) in record.iter() {
                let i = table.ensure_column(name);
                row.resize(table.header.len(), String::new());
                row[i] = value.to_owned();
            }
            table.rows.push(row);
        }

        let header = &table.header;
        let ids: Vec<RecordIdentifier> = table
            .rows
            .iter()
            .map(|row| self.key.identify_row(header, row))
            .collect();
        let mut last = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            last.insert(id, i);
        }

        let mut i = 0;
        table.rows.retain(|_| {
            let keep = last.get(&ids[i]) == Some(&i);
            i += 1;
            keep
        });
        table
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;

    use super::*;

    fn key() -> KeySpec {
        KeySpec::new(["Title", "Date"])
    }

    fn lecture(title: &str, date: &str, fee: &str) -> Record {
        Record::new()
            .with("Title", title)
            .with("Date", date)
            .with("Fee", fee)
    }

    #[test]
    fn empty_flush_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = RecordSink::new(&path, key());
        assert_eq!(sink.flush().unwrap(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn last_occurrence_wins_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let mut sink = RecordSink::new(&path, key());

        sink.buffer(lecture("Yoga", "1", "Free"));
        sink.buffer(lecture("Choir", "2", "5"));
        assert_eq!(sink.flush().unwrap(), 2);

        sink.buffer(lecture("Yoga", "1", "10"));
        sink.buffer(lecture("Pottery", "3", "7"));
        sink.buffer(lecture("Pottery", "3", "8"));
        assert_eq!(sink.flush().unwrap(), 3);
        assert_eq!(sink.buffered(), 0);

        let table = table::read(&path).unwrap().unwrap();
        assert_eq!(table.header, ["Title", "Date", "Fee"]);
        assert_eq!(
            table.rows,
            vec![
                vec!["Choir".to_owned(), "2".into(), "5".into()],
                vec!["Yoga".to_owned(), "1".into(), "10".into()],
                vec!["Pottery".to_owned(), "3".into(), "8".into()],
            ]
        );
    }

    #[test]
    fn new_columns_are_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "\u{feff}Title,Date\nYoga,1\n").unwrap();

        let mut sink = RecordSink::new(&path, key());
        sink.buffer(lecture("Choir", "2", "5"));
        sink.flush().unwrap();

        let table = table::read(&path).unwrap().unwrap();
        assert_eq!(table.header, ["Title", "Date", "Fee"]);
        assert_eq!(table.rows[0], ["Yoga", "1", ""]);
        assert_eq!(table.rows[1], ["Choir", "2", "5"]);
    }

    #[test]
    fn foreign_schema_falls_back_to_fresh_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "Name,Age\nA,1\n").unwrap();

        let mut sink = RecordSink::new(&path, key());
        sink.buffer(lecture("Yoga", "1", "Free"));
        assert_eq!(sink.flush().unwrap(), 1);

        let table = table::read(&path).unwrap().unwrap();
        assert_eq!(table.header, ["Title", "Date", "Fee"]);
        assert_eq!(table.rows.len(), 1);
    }

    #[test]
    fn failed_write_keeps_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), "x").unwrap();

        let mut sink = RecordSink::new(&path, key());
        sink.buffer(lecture("Yoga", "1", "Free"));
        assert!(sink.flush().is_err());
        assert_eq!(sink.buffered(), 1);
    }
}

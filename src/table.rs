//! Flat CSV tables as written by the record sink: UTF-8 with a BOM, `\n` line
//! endings, header row first.

use std::{fs, io, path::Path};

use csv::{ReaderBuilder, Terminator, WriterBuilder};

use crate::util::atomic_write;

const BOM: &str = "\u{feff}";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Table {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column(&self, name: &str) -> Option<usize> {
        self.header.iter().position(|h| h == name)
    }

    /// Appends `name` to the header if absent, padding existing rows.
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(i) = self.column(name) {
            return i;
        }
        self.header.push(name.to_owned());
        for row in &mut self.rows {
            row.resize(self.header.len(), String::new());
        }
        self.header.len() - 1
    }
}

pub fn parse(text: &str) -> csv::Result<Table> {
    let text = text.strip_prefix(BOM).unwrap_or(text);
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let header: Vec<String> = reader.headers()?.iter().map(ToOwned::to_owned).collect();
    let width = header.len();
    let mut rows = Vec::new();
    for result in reader.records() {
        let mut row: Vec<String> = result?.iter().map(ToOwned::to_owned).collect();
        row.resize(width, String::new());
        rows.push(row);
    }
    Ok(Table { header, rows })
}

/// Reads `path`; `Ok(None)` when the file does not exist.
pub fn read(path: &Path) -> anyhow::Result<Option<Table>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    Ok(Some(parse(&text)?))
}

pub fn to_bytes(table: &Table) -> csv::Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(BOM.as_bytes().to_vec());
    writer.write_record(&table.header)?;
    for row in &table.rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| e.into_error().into())
}

pub fn write(path: &Path, table: &Table) -> anyhow::Result<()> {
    let bytes = to_bytes(table)?;
    atomic_write(path, &bytes)?;
    Ok(())
}

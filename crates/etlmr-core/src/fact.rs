//! Bulk fact table, ported from `offdimtables.BulkFactTable`.

use std::io::{Seek, SeekFrom, Write};

use crate::error::{EtlError, Result};
use crate::row::{NameMapping, Row};

/// Callback invoked when a batch is ready to load: `(table, columns,
/// fieldsep, rowsep, nullsubst, data)`. Implementations bulk-copy `data`
/// into the warehouse (see `etlmr-cluster`'s default `tokio-postgres`
/// `COPY FROM STDIN` loader).
pub type BulkLoader = dyn FnMut(&str, &[String], &str, &str, Option<&str>, &[u8]) -> Result<()>;

/// Accumulates fact rows into a scratch buffer and flushes them through
/// a bulk-loader callback every `bulksize` rows.
pub struct BulkFactTable {
    pub name: String,
    pub keyrefs: Vec<String>,
    pub measures: Vec<String>,
    all: Vec<String>,
    fieldsep: String,
    rowsep: String,
    nullsubst: Option<String>,
    bulksize: usize,
    count: usize,
    buffer: Vec<u8>,
    /// Selected once at construction, mirroring the source picking
    /// `_insertwithnulls` vs `_insertwithoutnulls` up front rather than
    /// branching per row.
    skip_null_check: bool,
}

impl BulkFactTable {
    pub fn new(
        name: impl Into<String>,
        keyrefs: Vec<String>,
        measures: Vec<String>,
        fieldsep: impl Into<String>,
        rowsep: impl Into<String>,
        nullsubst: Option<String>,
        bulksize: usize,
    ) -> Result<Self> {
        let name = name.into();
        if keyrefs.is_empty() && measures.is_empty() {
            return Err(EtlError::Configuration(format!(
                "fact table {name}: must declare at least one keyref or measure"
            )));
        }
        let mut all = keyrefs.clone();
        all.extend(measures.iter().cloned());
        let skip_null_check = nullsubst.is_none();
        Ok(BulkFactTable {
            name,
            keyrefs,
            measures,
            all,
            fieldsep: fieldsep.into(),
            rowsep: rowsep.into(),
            nullsubst,
            bulksize: bulksize.max(1),
            count: 0,
            buffer: Vec::new(),
            skip_null_check,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.all
    }

    fn field_text(&self, row: &Row, mapping: &NameMapping, att: &str) -> String {
        match row.get_mapped(att, mapping) {
            Some(v) if !v.is_null() => v.to_string(),
            _ => {
                if self.skip_null_check {
                    // No nullsubst configured: emit the driver's native
                    // empty-field representation for NULL (COPY's default).
                    String::new()
                } else {
                    self.nullsubst.clone().unwrap_or_default()
                }
            }
        }
    }

    /// Appends one row to the scratch buffer, flushing if `bulksize` is
    /// reached.
    pub fn insert(&mut self, row: &Row, mapping: &NameMapping, loader: &mut BulkLoader) -> Result<()> {
        let fields: Vec<String> = self.all.iter().map(|att| self.field_text(row, mapping, att)).collect();
        self.buffer.write_all(fields.join(&self.fieldsep).as_bytes()).map_err(|e| EtlError::Other(e.into()))?;
        self.buffer.write_all(self.rowsep.as_bytes()).map_err(|e| EtlError::Other(e.into()))?;
        self.count += 1;
        if self.count >= self.bulksize {
            self.flush(loader)?;
        }
        Ok(())
    }

    fn flush(&mut self, loader: &mut BulkLoader) -> Result<()> {
        if self.count == 0 {
            return Ok(());
        }
        loader(&self.name, &self.all, &self.fieldsep, &self.rowsep, self.nullsubst.as_deref(), &self.buffer)?;
        self.buffer.clear();
        self.count = 0;
        Ok(())
    }

    /// Flushes any residual rows. Must be called once per task at the
    /// end of the fact phase.
    pub fn endload(&mut self, loader: &mut BulkLoader) -> Result<()> {
        self.flush(loader)
    }
}

/// Scratch sink backed by a real file, for bulk-loaders that stream the
/// accumulated batch from disk (matching the source's `tempfile`-backed
/// `BulkFactTable.tempdest`) rather than from an in-memory buffer.
pub struct FileBackedSink {
    file: std::fs::File,
}

impl FileBackedSink {
    pub fn new(file: std::fs::File) -> Self {
        FileBackedSink { file }
    }

    pub fn rewind_and_truncate(&mut self) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.set_len(0)
    }

    pub fn file_mut(&mut self) -> &mut std::fs::File {
        &mut self.file
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Value;

    #[test]
    fn flushes_at_bulksize() {
        let flushed = std::rc::Rc::new(std::cell::RefCell::new(0usize));
        let mut fact = BulkFactTable::new(
            "testresultsfact",
            vec!["pageid".into(), "testid".into(), "dateid".into()],
            vec!["errors".into()],
            "\t",
            "\n",
            None,
            2,
        )
        .unwrap();
        let mapping = NameMapping::new();
        let flushed_handle = flushed.clone();
        let mut loader: Box<BulkLoader> =
            Box::new(move |_: &str, _: &[String], _: &str, _: &str, _: Option<&str>, _: &[u8]| {
                *flushed_handle.borrow_mut() += 1;
                Ok(())
            });
        for i in 0..5 {
            let mut row = Row::new();
            row.set("pageid", i as i64);
            row.set("testid", 1i64);
            row.set("dateid", 1i64);
            row.set("errors", 0i64);
            fact.insert(&row, &mapping, &mut *loader).unwrap();
        }
        fact.endload(&mut *loader).unwrap();
        assert_eq!(*flushed.borrow(), 3); // two full batches of 2 plus one residual flush
    }

    #[test]
    fn null_value_uses_nullsubst_when_configured() {
        let mut fact = BulkFactTable::new(
            "t",
            vec!["a".into()],
            vec![],
            "\t",
            "\n",
            Some("\\N".into()),
            10,
        )
        .unwrap();
        let mapping = NameMapping::new();
        let mut row = Row::new();
        row.set("a", Value::Null);
        let captured = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let captured_handle = captured.clone();
        let mut loader: Box<BulkLoader> =
            Box::new(move |_: &str, _: &[String], _: &str, _: &str, _: Option<&str>, data: &[u8]| {
                *captured_handle.borrow_mut() = data.to_vec();
                Ok(())
            });
        fact.insert(&row, &mapping, &mut *loader).unwrap();
        fact.endload(&mut *loader).unwrap();
        assert_eq!(String::from_utf8(captured.borrow().clone()).unwrap(), "\\N\n");
    }
}

use std::rc::Rc;

use crate::constant::ServerStatusFlags;
use crate::protocol::column::Column;
use crate::protocol::value::Value;

/// Outcome of a query or statement execution.
///
/// Commands without a result set carry the OK-packet counters and an empty
/// row list; row-producing commands always carry their full column metadata
/// (there is no metadata-free shortcut path).
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Rc<Vec<Column>>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub status_flags: ServerStatusFlags,
}

impl QueryResult {
    pub(crate) fn without_rows(
        affected_rows: u64,
        last_insert_id: u64,
        warnings: u16,
        status_flags: ServerStatusFlags,
    ) -> Self {
        Self {
            columns: Rc::new(Vec::new()),
            rows: Vec::new(),
            affected_rows,
            last_insert_id,
            warnings,
            status_flags,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// One decoded row, sharing the result's column metadata.
#[derive(Debug, Clone)]
pub struct Row {
    pub(crate) columns: Rc<Vec<Column>>,
    pub(crate) values: Vec<Value>,
}

impl Row {
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Look a value up by column name.
    pub fn get_named(&self, name: &str) -> Option<&Value> {
        let index = self.columns.iter().position(|c| c.name == name)?;
        self.values.get(index)
    }
}

use async_trait::async_trait;
use log::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use crate::actions::{CellValue, ColValues, DocAction, RowId, RowValues};

/// Columnar snapshot of one table: row `i` has id `row_ids[i]` and cell
/// `columns[col_id][i]`. Column arrays are kept in lockstep with `row_ids`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableData {
  pub table_id: String,
  pub row_ids: Vec<RowId>,
  pub columns: ColValues,
}

impl TableData {
  pub fn new(table_id: impl Into<String>) -> Self {
    return TableData {
      table_id: table_id.into(),
      row_ids: vec![],
      columns: ColValues::new(),
    };
  }

  #[inline]
  pub fn len(&self) -> usize {
    return self.row_ids.len();
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    return self.row_ids.is_empty();
  }

  pub fn row_index(&self, row_id: RowId) -> Option<usize> {
    return self.row_ids.iter().position(|id| *id == row_id);
  }

  #[inline]
  pub fn has_row(&self, row_id: RowId) -> bool {
    return self.row_index(row_id).is_some();
  }

  pub fn cell(&self, col_id: &str, index: usize) -> Option<&CellValue> {
    return self.columns.get(col_id).and_then(|v| v.get(index));
  }

  /// Ensure `col_id` exists, padding missing cells with nulls.
  fn ensure_column(&mut self, col_id: &str) -> &mut Vec<CellValue> {
    let len = self.row_ids.len();
    let col = self
      .columns
      .entry(col_id.to_string())
      .or_insert_with(Vec::new);
    col.resize(len, Value::Null);
    return col;
  }

  /// Insert or overwrite a single row.
  pub fn upsert_row(&mut self, row_id: RowId, values: &RowValues) {
    let index = match self.row_index(row_id) {
      Some(index) => index,
      None => {
        self.row_ids.push(row_id);
        for col in self.columns.values_mut() {
          col.push(Value::Null);
        }
        self.row_ids.len() - 1
      }
    };
    for (col_id, value) in values {
      self.ensure_column(col_id)[index] = value.clone();
    }
  }

  pub fn update_row(&mut self, row_id: RowId, values: &RowValues) {
    let Some(index) = self.row_index(row_id) else {
      debug!("update for missing row {row_id} in {}", self.table_id);
      return;
    };
    for (col_id, value) in values {
      self.ensure_column(col_id)[index] = value.clone();
    }
  }

  pub fn remove_row(&mut self, row_id: RowId) {
    let Some(index) = self.row_index(row_id) else {
      return;
    };
    self.row_ids.remove(index);
    for col in self.columns.values_mut() {
      if index < col.len() {
        col.remove(index);
      }
    }
  }

  /// Merge fetched rows into this snapshot, overwriting duplicates.
  pub fn merge_rows(&mut self, other: &TableData) {
    for (index, row_id) in other.row_ids.iter().enumerate() {
      let values: RowValues = other
        .columns
        .iter()
        .map(|(col_id, cells)| {
          (
            col_id.clone(),
            cells.get(index).cloned().unwrap_or(Value::Null),
          )
        })
        .collect();
      self.upsert_row(*row_id, &values);
    }
  }
}

impl From<TableData> for DocAction {
  fn from(data: TableData) -> Self {
    return DocAction::TableData {
      table_id: data.table_id,
      row_ids: data.row_ids,
      columns: data.columns,
    };
  }
}

/// Read access to a set of table snapshots. Implemented both by the live
/// [DocData] store and by the copy-on-write metadata snapshots taken during
/// step construction.
pub trait TableReader {
  fn table(&self, table_id: &str) -> Option<&TableData>;
}

/// A filtered fetch against the backing database: all rows of `table_id`
/// matching every filter (column value in the given set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableQuery {
  pub table_id: String,
  pub filters: HashMap<String, Vec<CellValue>>,
}

impl TableQuery {
  pub fn whole_table(table_id: impl Into<String>) -> Self {
    return TableQuery {
      table_id: table_id.into(),
      filters: HashMap::new(),
    };
  }

  pub fn by_row_ids(table_id: impl Into<String>, row_ids: impl IntoIterator<Item = RowId>) -> Self {
    let mut filters = HashMap::new();
    filters.insert(
      "id".to_string(),
      row_ids.into_iter().map(Value::from).collect(),
    );
    return TableQuery {
      table_id: table_id.into(),
      filters,
    };
  }
}

/// Row fetches against the backing database, injected by the host. Step
/// construction and user-attribute lookups both suspend here.
#[async_trait]
pub trait RowSource: Send + Sync {
  async fn fetch_query(&self, query: &TableQuery) -> Result<TableData, String>;
}

/// In-memory relational view of the document, addressable by table id.
/// Mutations arrive exclusively as [DocAction]s via [DocData::receive_action].
#[derive(Debug, Clone, Default)]
pub struct DocData {
  tables: BTreeMap<String, TableData>,
}

impl DocData {
  pub fn new() -> Self {
    return DocData::default();
  }

  pub fn from_tables(tables: impl IntoIterator<Item = TableData>) -> Self {
    return DocData {
      tables: tables
        .into_iter()
        .map(|t| (t.table_id.clone(), t))
        .collect(),
    };
  }

  pub fn get_table(&self, table_id: &str) -> Option<&TableData> {
    return self.tables.get(table_id);
  }

  pub fn table_ids(&self) -> impl Iterator<Item = &str> {
    return self.tables.keys().map(|k| k.as_str());
  }

  /// Load (or replace) a full table snapshot.
  pub fn load_table(&mut self, data: TableData) {
    self.tables.insert(data.table_id.clone(), data);
  }

  /// Merge fetched rows into an existing table, creating it if absent.
  pub fn sync_table(&mut self, data: &TableData) {
    let table = self
      .tables
      .entry(data.table_id.clone())
      .or_insert_with(|| TableData::new(data.table_id.clone()));
    table.merge_rows(data);
  }

  /// Apply one action to the store. Unknown rows and tables are tolerated
  /// with a debug log; the scratch copies built during step construction may
  /// legitimately replay actions against partially-synced state.
  pub fn receive_action(&mut self, action: &DocAction) {
    match action {
      DocAction::AddRecord {
        table_id,
        row_id,
        columns,
      } => {
        self.table_mut(table_id).upsert_row(*row_id, columns);
      }
      DocAction::BulkAddRecord {
        table_id,
        row_ids,
        columns,
      } => {
        let table = self.table_mut(table_id);
        for (index, row_id) in row_ids.iter().enumerate() {
          table.upsert_row(*row_id, &row_at(columns, index));
        }
      }
      DocAction::UpdateRecord {
        table_id,
        row_id,
        columns,
      } => {
        self.table_mut(table_id).update_row(*row_id, columns);
      }
      DocAction::BulkUpdateRecord {
        table_id,
        row_ids,
        columns,
      } => {
        let table = self.table_mut(table_id);
        for (index, row_id) in row_ids.iter().enumerate() {
          table.update_row(*row_id, &row_at(columns, index));
        }
      }
      DocAction::RemoveRecord { table_id, row_id } => {
        self.table_mut(table_id).remove_row(*row_id);
      }
      DocAction::BulkRemoveRecord { table_id, row_ids } => {
        let table = self.table_mut(table_id);
        for row_id in row_ids {
          table.remove_row(*row_id);
        }
      }
      DocAction::ReplaceTableData {
        table_id,
        row_ids,
        columns,
      }
      | DocAction::TableData {
        table_id,
        row_ids,
        columns,
      } => {
        self.load_table(TableData {
          table_id: table_id.clone(),
          row_ids: row_ids.clone(),
          columns: columns.clone(),
        });
      }
      DocAction::AddTable { table_id, columns } => {
        let mut table = TableData::new(table_id.clone());
        for info in columns {
          if let Some(col_id) = info.get("id").and_then(|v| v.as_str()) {
            table.columns.insert(col_id.to_string(), vec![]);
          }
        }
        self.load_table(table);
      }
      DocAction::RemoveTable { table_id } => {
        self.tables.remove(table_id);
      }
      DocAction::RenameTable {
        table_id,
        new_table_id,
      } => {
        if let Some(mut table) = self.tables.remove(table_id) {
          table.table_id = new_table_id.clone();
          self.tables.insert(new_table_id.clone(), table);
        }
      }
      DocAction::AddColumn {
        table_id, col_id, ..
      } => {
        self.table_mut(table_id).ensure_column(col_id);
      }
      DocAction::RemoveColumn { table_id, col_id } => {
        if let Some(table) = self.tables.get_mut(table_id) {
          table.columns.shift_remove(col_id);
        }
      }
      DocAction::RenameColumn {
        table_id,
        col_id,
        new_col_id,
      } => {
        if let Some(table) = self.tables.get_mut(table_id) {
          if let Some(cells) = table.columns.shift_remove(col_id) {
            table.columns.insert(new_col_id.clone(), cells);
          }
        }
      }
      DocAction::ModifyColumn {
        table_id, col_id, ..
      } => {
        // Type/formula changes don't affect stored cells here.
        self.table_mut(table_id).ensure_column(col_id);
      }
    }
  }

  fn table_mut(&mut self, table_id: &str) -> &mut TableData {
    return self
      .tables
      .entry(table_id.to_string())
      .or_insert_with(|| TableData::new(table_id));
  }
}

impl TableReader for DocData {
  fn table(&self, table_id: &str) -> Option<&TableData> {
    return self.get_table(table_id);
  }
}

/// Extract row `index` of a column-major payload as a single-row map.
pub fn row_at(columns: &ColValues, index: usize) -> RowValues {
  return columns
    .iter()
    .map(|(col_id, cells)| {
      (
        col_id.clone(),
        cells.get(index).cloned().unwrap_or(Value::Null),
      )
    })
    .collect();
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn table() -> TableData {
    let mut t = TableData::new("T");
    t.row_ids = vec![1, 2];
    t.columns.insert("a".into(), vec![json!("x"), json!("y")]);
    t.columns.insert("b".into(), vec![json!(1), json!(2)]);
    return t;
  }

  #[test]
  fn test_row_ops_stay_in_lockstep() {
    let mut doc = DocData::from_tables([table()]);

    doc.receive_action(&DocAction::AddRecord {
      table_id: "T".into(),
      row_id: 3,
      columns: [("a".to_string(), json!("z"))].into_iter().collect(),
    });
    let t = doc.get_table("T").unwrap();
    assert_eq!(t.row_ids, vec![1, 2, 3]);
    assert_eq!(t.cell("a", 2), Some(&json!("z")));
    // Column "b" was padded.
    assert_eq!(t.cell("b", 2), Some(&Value::Null));

    doc.receive_action(&DocAction::RemoveRecord {
      table_id: "T".into(),
      row_id: 2,
    });
    let t = doc.get_table("T").unwrap();
    assert_eq!(t.row_ids, vec![1, 3]);
    assert_eq!(t.columns["a"], vec![json!("x"), json!("z")]);
  }

  #[test]
  fn test_update_creates_missing_column() {
    let mut doc = DocData::from_tables([table()]);
    doc.receive_action(&DocAction::UpdateRecord {
      table_id: "T".into(),
      row_id: 1,
      columns: [("c".to_string(), json!(true))].into_iter().collect(),
    });
    let t = doc.get_table("T").unwrap();
    assert_eq!(t.cell("c", 0), Some(&json!(true)));
    assert_eq!(t.cell("c", 1), Some(&Value::Null));
  }

  #[test]
  fn test_schema_ops() {
    let mut doc = DocData::from_tables([table()]);

    doc.receive_action(&DocAction::RenameColumn {
      table_id: "T".into(),
      col_id: "a".into(),
      new_col_id: "a2".into(),
    });
    assert!(doc.get_table("T").unwrap().columns.contains_key("a2"));

    doc.receive_action(&DocAction::RenameTable {
      table_id: "T".into(),
      new_table_id: "T2".into(),
    });
    assert!(doc.get_table("T").is_none());
    assert_eq!(doc.get_table("T2").unwrap().row_ids, vec![1, 2]);

    doc.receive_action(&DocAction::RemoveTable {
      table_id: "T2".into(),
    });
    assert!(doc.get_table("T2").is_none());
  }

  #[test]
  fn test_add_is_upsert() {
    // Re-applying an add against partially-synced scratch state must not
    // duplicate the row.
    let mut doc = DocData::from_tables([table()]);
    doc.receive_action(&DocAction::AddRecord {
      table_id: "T".into(),
      row_id: 1,
      columns: [("a".to_string(), json!("x2"))].into_iter().collect(),
    });
    let t = doc.get_table("T").unwrap();
    assert_eq!(t.row_ids, vec![1, 2]);
    assert_eq!(t.cell("a", 0), Some(&json!("x2")));
  }
}

use serde_json::Value;

use crate::actions::{CellValue, ColValues, RowId, RowValues};
use crate::doc_data::TableData;

/// Read-only row-shaped view over a columnar table snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
  table: &'a TableData,
  index: usize,
}

impl<'a> RecordView<'a> {
  pub fn new(table: &'a TableData, index: usize) -> Self {
    debug_assert!(index < table.row_ids.len());
    return RecordView { table, index };
  }

  pub fn by_row_id(table: &'a TableData, row_id: RowId) -> Option<Self> {
    let index = table.row_index(row_id)?;
    return Some(RecordView { table, index });
  }

  #[inline]
  pub fn row_id(&self) -> RowId {
    return self.table.row_ids[self.index];
  }

  pub fn get(&self, col_id: &str) -> Option<&'a CellValue> {
    return self.table.cell(col_id, self.index);
  }

  pub fn col_ids(&self) -> impl Iterator<Item = &'a str> {
    return self.table.columns.keys().map(|k| k.as_str());
  }

  /// Materialize the row as a column-id-to-value map (includes `id`).
  pub fn to_map(&self) -> RowValues {
    let mut values = RowValues::new();
    values.insert("id".to_string(), Value::from(self.row_id()));
    for (col_id, cells) in &self.table.columns {
      values.insert(
        col_id.clone(),
        cells.get(self.index).cloned().unwrap_or(Value::Null),
      );
    }
    return values;
  }
}

/// Editable row-shaped view over the column-major payload of an action.
/// Writes land directly in the payload, which is how structural censorship
/// blanks individual fields without reshaping the action.
pub struct RecordEditor<'a> {
  row_id: RowId,
  columns: &'a mut ColValues,
  index: usize,
}

impl<'a> RecordEditor<'a> {
  pub fn new(row_id: RowId, columns: &'a mut ColValues, index: usize) -> Self {
    return RecordEditor {
      row_id,
      columns,
      index,
    };
  }

  #[inline]
  pub fn row_id(&self) -> RowId {
    return self.row_id;
  }

  pub fn get(&self, col_id: &str) -> Option<&CellValue> {
    return self.columns.get(col_id).and_then(|v| v.get(self.index));
  }

  /// Overwrite a field if it is present in the payload. Absent columns are
  /// left alone; partial updates only carry the fields they touch.
  pub fn set(&mut self, col_id: &str, value: CellValue) {
    if let Some(cells) = self.columns.get_mut(col_id) {
      if let Some(cell) = cells.get_mut(self.index) {
        *cell = value;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn table() -> TableData {
    let mut t = TableData::new("T");
    t.row_ids = vec![7, 8];
    t.columns.insert("a".into(), vec![json!("x"), json!("y")]);
    return t;
  }

  #[test]
  fn test_record_view() {
    let t = table();
    let rec = RecordView::by_row_id(&t, 8).unwrap();
    assert_eq!(rec.row_id(), 8);
    assert_eq!(rec.get("a"), Some(&json!("y")));
    assert_eq!(rec.get("missing"), None);

    let map = rec.to_map();
    assert_eq!(map["id"], json!(8));
    assert_eq!(map["a"], json!("y"));

    assert!(RecordView::by_row_id(&t, 99).is_none());
  }

  #[test]
  fn test_record_editor_ignores_absent_columns() {
    let mut t = table();
    let mut editor = RecordEditor::new(7, &mut t.columns, 0);
    editor.set("a", json!(""));
    editor.set("missing", json!("nope"));
    assert_eq!(t.columns["a"][0], json!(""));
    assert!(!t.columns.contains_key("missing"));
  }
}

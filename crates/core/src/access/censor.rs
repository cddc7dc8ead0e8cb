use serde_json::json;
use std::collections::{HashMap, HashSet};

use crate::access::permission_info::PermissionInfo;
use crate::access::permissions::Perm;
use crate::actions::{CellValue, DocAction, RowId, RowValues};
use crate::constants::{
  is_acl_table, is_censorable_table, COLUMNS_TABLE, FIELDS_TABLE, MANUAL_SORT, SECTIONS_TABLE,
  TABLES_TABLE, VIEWS_TABLE,
};
use crate::doc_data::TableReader;
use crate::records::RecordEditor;

/// Fields blanked when a row of a structural table is censored, bit-exact.
fn blank_fields(table_id: &str) -> &'static [(&'static str, fn() -> CellValue)] {
  fn empty() -> CellValue {
    return json!("");
  }
  fn zero() -> CellValue {
    return json!(0);
  }
  fn any_type() -> CellValue {
    return json!("Any");
  }

  match table_id {
    TABLES_TABLE => &[("tableId", empty)],
    VIEWS_TABLE => &[("name", empty)],
    SECTIONS_TABLE => &[("title", empty), ("tableRef", zero)],
    COLUMNS_TABLE => &[
      ("label", empty),
      ("colId", empty),
      ("widgetOptions", empty),
      ("formula", empty),
      ("type", any_type),
      ("parentId", zero),
    ],
    FIELDS_TABLE => &[("widgetOptions", empty), ("filter", empty), ("parentId", zero)],
    _ => &[],
  }
}

/// The forbidden structural entities for one viewer, derived from the
/// post-step metadata. Row ids, not object pointers: sections, views, tables
/// and columns form cycles, so everything is integer-keyed (arena style).
pub struct CensorshipInfo {
  pub censored_tables: HashSet<RowId>,
  pub uncensored_tables: HashSet<RowId>,
  pub censored_columns: HashSet<RowId>,
  pub censored_sections: HashSet<RowId>,
  pub censored_views: HashSet<RowId>,
  pub censored_fields: HashSet<RowId>,
}

impl CensorshipInfo {
  pub fn new(meta: &dyn TableReader, perm_info: &PermissionInfo) -> Self {
    let mut censored_tables = HashSet::new();
    let mut uncensored_tables = HashSet::new();
    // Row id of each table row -> its tableId string, for column checks.
    let mut table_names: HashMap<RowId, String> = HashMap::new();

    if let Some(tables) = meta.table(TABLES_TABLE) {
      for (index, row_id) in tables.row_ids.iter().enumerate() {
        let Some(table_id) = tables.cell("tableId", index).and_then(|v| v.as_str()) else {
          continue;
        };
        table_names.insert(*row_id, table_id.to_string());
        match perm_info.get_table_access(table_id).perms.read {
          Perm::Deny => {
            censored_tables.insert(*row_id);
          }
          Perm::Allow => {
            uncensored_tables.insert(*row_id);
          }
          Perm::Mixed => {}
        }
      }
    }

    let mut censored_columns = HashSet::new();
    if let Some(columns) = meta.table(COLUMNS_TABLE) {
      for (index, row_id) in columns.row_ids.iter().enumerate() {
        let col_id = columns
          .cell("colId", index)
          .and_then(|v| v.as_str())
          .unwrap_or("");
        if col_id == MANUAL_SORT {
          continue;
        }
        let parent = columns
          .cell("parentId", index)
          .and_then(|v| v.as_i64())
          .unwrap_or(0);
        if censored_tables.contains(&parent) {
          censored_columns.insert(*row_id);
          continue;
        }
        if let Some(table_id) = table_names.get(&parent) {
          if perm_info.get_column_access(table_id, col_id).perms.read == Perm::Deny {
            censored_columns.insert(*row_id);
          }
        }
      }
    }

    let mut censored_sections = HashSet::new();
    let mut censored_views = HashSet::new();
    if let Some(sections) = meta.table(SECTIONS_TABLE) {
      for (index, row_id) in sections.row_ids.iter().enumerate() {
        let table_ref = sections
          .cell("tableRef", index)
          .and_then(|v| v.as_i64())
          .unwrap_or(0);
        if censored_tables.contains(&table_ref) {
          censored_sections.insert(*row_id);
          if let Some(parent) = sections.cell("parentId", index).and_then(|v| v.as_i64()) {
            if parent != 0 {
              censored_views.insert(parent);
            }
          }
        }
      }
    }

    let mut censored_fields = HashSet::new();
    if let Some(fields) = meta.table(FIELDS_TABLE) {
      for (index, row_id) in fields.row_ids.iter().enumerate() {
        let parent = fields
          .cell("parentId", index)
          .and_then(|v| v.as_i64())
          .unwrap_or(0);
        let col_ref = fields
          .cell("colRef", index)
          .and_then(|v| v.as_i64())
          .unwrap_or(0);
        if censored_sections.contains(&parent) || censored_columns.contains(&col_ref) {
          censored_fields.insert(*row_id);
        }
      }
    }

    return CensorshipInfo {
      censored_tables,
      uncensored_tables,
      censored_columns,
      censored_sections,
      censored_views,
      censored_fields,
    };
  }

  fn censored_set(&self, table_id: &str) -> &HashSet<RowId> {
    return match table_id {
      TABLES_TABLE => &self.censored_tables,
      COLUMNS_TABLE => &self.censored_columns,
      VIEWS_TABLE => &self.censored_views,
      SECTIONS_TABLE => &self.censored_sections,
      FIELDS_TABLE => &self.censored_fields,
      _ => unreachable!("not a censorable table: {table_id}"),
    };
  }

  /// Rewrite one structural-table action for the viewer. Returns `None` when
  /// the action is suppressed entirely (ACL tables for non-rule-viewers and
  /// row ops on them).
  pub fn censor_action(
    &self,
    mut action: DocAction,
    can_view_access_rules: bool,
  ) -> Option<DocAction> {
    let table_id = action.table_id().to_string();

    if is_acl_table(&table_id) {
      if can_view_access_rules {
        return Some(action);
      }
      // Non-rule-viewers get an empty payload rather than rule contents.
      return match action {
        DocAction::TableData {
          table_id, columns, ..
        }
        | DocAction::ReplaceTableData {
          table_id, columns, ..
        } => Some(DocAction::TableData {
          table_id,
          row_ids: vec![],
          columns: columns.into_iter().map(|(col, _)| (col, vec![])).collect(),
        }),
        _ => None,
      };
    }

    if !is_censorable_table(&table_id) {
      return Some(action);
    }
    let censored = self.censored_set(&table_id);
    if censored.is_empty() {
      return Some(action);
    }

    match &mut action {
      DocAction::AddRecord {
        row_id, columns, ..
      }
      | DocAction::UpdateRecord {
        row_id, columns, ..
      } => {
        if censored.contains(row_id) {
          blank_single(&table_id, columns);
        }
      }
      DocAction::BulkAddRecord {
        row_ids, columns, ..
      }
      | DocAction::BulkUpdateRecord {
        row_ids, columns, ..
      }
      | DocAction::ReplaceTableData {
        row_ids, columns, ..
      }
      | DocAction::TableData {
        row_ids, columns, ..
      } => {
        for (index, row_id) in row_ids.clone().into_iter().enumerate() {
          if !censored.contains(&row_id) {
            continue;
          }
          let mut editor = RecordEditor::new(row_id, columns, index);
          for (field, value) in blank_fields(&table_id) {
            editor.set(field, value());
          }
        }
      }
      // Removals of censored rows reveal nothing.
      _ => {}
    }
    return Some(action);
  }
}

fn blank_single(table_id: &str, columns: &mut RowValues) {
  for (field, value) in blank_fields(table_id) {
    if let Some(cell) = columns.get_mut(*field) {
      *cell = value();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::access::permission_info::PermissionInfo;
  use crate::access::rules::RuleCollection;
  use crate::access::test_utils::{acl_tables, structural_fixture, user, TestCompiler};
  use crate::doc_data::DocData;
  use crate::session::Role;
  use std::sync::Arc;

  fn viewer_info(doc: &DocData) -> PermissionInfo {
    let rules = Arc::new(RuleCollection::build(doc, &TestCompiler));
    return PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));
  }

  #[test]
  fn test_censored_sets() {
    // Table B read-denied for non-owners; structural metadata has tables A
    // (row 1) and B (row 2), with columns, a section and a field each.
    let mut tables = acl_tables(&[("B", "*", "user.Access != 'owners'", "-R", "")]);
    tables.extend(structural_fixture());
    let doc = DocData::from_tables(tables);

    let info = viewer_info(&doc);
    let censorship = CensorshipInfo::new(&doc, &info);

    assert!(censorship.censored_tables.contains(&2));
    assert!(!censorship.censored_tables.contains(&1));
    assert!(censorship.uncensored_tables.contains(&1));
    // Columns 21/22 belong to B, 11/12 to A; manualSort row 23 exempt.
    assert!(censorship.censored_columns.contains(&21));
    assert!(censorship.censored_columns.contains(&22));
    assert!(!censorship.censored_columns.contains(&23));
    assert!(!censorship.censored_columns.contains(&11));
    // Section 102 shows B, inside view 2; field 202 shows a B column.
    assert!(censorship.censored_sections.contains(&102));
    assert!(censorship.censored_views.contains(&2));
    assert!(!censorship.censored_sections.contains(&101));
    assert!(censorship.censored_fields.contains(&202));
  }

  #[test]
  fn test_blanking_is_bit_exact() {
    let mut tables = acl_tables(&[("B", "*", "user.Access != 'owners'", "-R", "")]);
    tables.extend(structural_fixture());
    let doc = DocData::from_tables(tables);
    let info = viewer_info(&doc);
    let censorship = CensorshipInfo::new(&doc, &info);

    let action: DocAction = doc.get_table(TABLES_TABLE).unwrap().clone().into();
    let censored = censorship.censor_action(action, false).unwrap();
    let DocAction::TableData { columns, row_ids, .. } = censored else {
      panic!("expected TableData");
    };
    let b_index = row_ids.iter().position(|id| *id == 2).unwrap();
    let a_index = row_ids.iter().position(|id| *id == 1).unwrap();
    assert_eq!(columns["tableId"][b_index], json!(""));
    assert_eq!(columns["tableId"][a_index], json!("A"));
  }

  #[test]
  fn test_acl_tables_emptied_for_non_rule_viewers() {
    let doc = DocData::from_tables(structural_fixture());
    let info = viewer_info(&doc);
    let censorship = CensorshipInfo::new(&doc, &info);

    let mut acl = crate::doc_data::TableData::new(crate::constants::ACL_RULES_TABLE);
    acl.row_ids = vec![1];
    acl.columns.insert("aclFormula".into(), vec![json!("secret")]);
    let action: DocAction = acl.clone().into();

    let censored = censorship.censor_action(action.clone(), false).unwrap();
    let DocAction::TableData { row_ids, columns, .. } = censored else {
      panic!("expected TableData");
    };
    assert!(row_ids.is_empty());
    assert!(columns["aclFormula"].is_empty());

    // Rule viewers get the original.
    assert_eq!(censorship.censor_action(action.clone(), true), Some(action));

    // Row ops on ACL tables are suppressed outright.
    let update = DocAction::UpdateRecord {
      table_id: crate::constants::ACL_RULES_TABLE.into(),
      row_id: 1,
      columns: RowValues::new(),
    };
    assert_eq!(censorship.censor_action(update, false), None);
  }
}

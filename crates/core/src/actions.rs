use indexmap::IndexMap;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::constants::is_acl_table;

pub type RowId = i64;
pub type CellValue = Value;

/// Column-major cell payload: column id to one value per row.
pub type ColValues = IndexMap<String, Vec<CellValue>>;
/// Single-row cell payload: column id to value.
pub type RowValues = IndexMap<String, CellValue>;

/// Low-level action applied to the document store. Row ops carry cells in
/// either singleton or bulk (column-major) form; schema ops describe table
/// and column changes. Every variant names its table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action")]
pub enum DocAction {
  AddRecord {
    table_id: String,
    row_id: RowId,
    columns: RowValues,
  },
  BulkAddRecord {
    table_id: String,
    row_ids: Vec<RowId>,
    columns: ColValues,
  },
  UpdateRecord {
    table_id: String,
    row_id: RowId,
    columns: RowValues,
  },
  BulkUpdateRecord {
    table_id: String,
    row_ids: Vec<RowId>,
    columns: ColValues,
  },
  RemoveRecord {
    table_id: String,
    row_id: RowId,
  },
  BulkRemoveRecord {
    table_id: String,
    row_ids: Vec<RowId>,
  },
  ReplaceTableData {
    table_id: String,
    row_ids: Vec<RowId>,
    columns: ColValues,
  },
  TableData {
    table_id: String,
    row_ids: Vec<RowId>,
    columns: ColValues,
  },
  AddTable {
    table_id: String,
    columns: Vec<RowValues>,
  },
  RemoveTable {
    table_id: String,
  },
  RenameTable {
    table_id: String,
    new_table_id: String,
  },
  AddColumn {
    table_id: String,
    col_id: String,
    col_info: RowValues,
  },
  RemoveColumn {
    table_id: String,
    col_id: String,
  },
  RenameColumn {
    table_id: String,
    col_id: String,
    new_col_id: String,
  },
  ModifyColumn {
    table_id: String,
    col_id: String,
    col_info: RowValues,
  },
}

impl DocAction {
  pub fn table_id(&self) -> &str {
    use DocAction::*;
    return match self {
      AddRecord { table_id, .. }
      | BulkAddRecord { table_id, .. }
      | UpdateRecord { table_id, .. }
      | BulkUpdateRecord { table_id, .. }
      | RemoveRecord { table_id, .. }
      | BulkRemoveRecord { table_id, .. }
      | ReplaceTableData { table_id, .. }
      | TableData { table_id, .. }
      | AddTable { table_id, .. }
      | RemoveTable { table_id }
      | RenameTable { table_id, .. }
      | AddColumn { table_id, .. }
      | RemoveColumn { table_id, .. }
      | RenameColumn { table_id, .. }
      | ModifyColumn { table_id, .. } => table_id,
    };
  }

  /// True for table- and column-shape changes, false for row ops.
  pub fn is_schema_action(&self) -> bool {
    use DocAction::*;
    return matches!(
      self,
      AddTable { .. }
        | RemoveTable { .. }
        | RenameTable { .. }
        | AddColumn { .. }
        | RemoveColumn { .. }
        | RenameColumn { .. }
        | ModifyColumn { .. }
    );
  }

  #[inline]
  pub fn is_data_action(&self) -> bool {
    return !self.is_schema_action();
  }

  /// Row ids touched by a row op. Empty for schema ops.
  pub fn row_ids(&self) -> Vec<RowId> {
    use DocAction::*;
    return match self {
      AddRecord { row_id, .. } | UpdateRecord { row_id, .. } | RemoveRecord { row_id, .. } => {
        vec![*row_id]
      }
      BulkAddRecord { row_ids, .. }
      | BulkUpdateRecord { row_ids, .. }
      | BulkRemoveRecord { row_ids, .. }
      | ReplaceTableData { row_ids, .. }
      | TableData { row_ids, .. } => row_ids.clone(),
      _ => vec![],
    };
  }

  /// True if the action introduces its touched rows; row pruning keeps such
  /// actions untouched for newly-visible rows.
  pub fn is_add_like(&self) -> bool {
    use DocAction::*;
    return matches!(
      self,
      AddRecord { .. }
        | BulkAddRecord { .. }
        | ReplaceTableData { .. }
        | TableData { .. }
    );
  }

  pub fn is_remove_like(&self) -> bool {
    use DocAction::*;
    return matches!(self, RemoveRecord { .. } | BulkRemoveRecord { .. });
  }

  /// Cell-carrying row ops, i.e. candidates for column pruning and cell
  /// censoring.
  pub fn has_cells(&self) -> bool {
    use DocAction::*;
    return matches!(
      self,
      AddRecord { .. }
        | BulkAddRecord { .. }
        | UpdateRecord { .. }
        | BulkUpdateRecord { .. }
        | ReplaceTableData { .. }
        | TableData { .. }
    );
  }
}

/// Names of user actions that are always allowed.
const OK_ACTIONS: [&str; 1] = ["Calculate"];

/// Actions that are only surprising in the presence of nuanced access
/// restrictions.
const SPECIAL_ACTIONS: [&str; 10] = [
  "InitNewDoc",
  "EvalCode",
  "SetDisplayFormula",
  "UpdateSummaryViewSection",
  "DetachSummaryViewSection",
  "GenImporterView",
  "TransformAndFinishImport",
  "AddView",
  "CopyFromColumn",
  "AddHiddenColumn",
];

/// Actions we'd expect only from users with full access.
const SURPRISING_ACTIONS: [&str; 2] = ["RemoveView", "AddViewSection"];

/// Row-op user actions checked against table/column permissions before
/// lowering.
const DATA_ACTIONS: [&str; 8] = [
  "AddRecord",
  "BulkAddRecord",
  "UpdateRecord",
  "BulkUpdateRecord",
  "RemoveRecord",
  "BulkRemoveRecord",
  "ReplaceTableData",
  "TableData",
];

/// Container actions whose payload is a nested action list.
const CONTAINER_ACTIONS: [&str; 2] = ["ApplyUndoActions", "ApplyDocActions"];

lazy_static! {
  static ref OK_SET: HashSet<&'static str> = OK_ACTIONS.into_iter().collect();
  static ref SPECIAL_SET: HashSet<&'static str> = SPECIAL_ACTIONS.into_iter().collect();
  static ref SURPRISING_SET: HashSet<&'static str> = SURPRISING_ACTIONS.into_iter().collect();
  static ref DATA_SET: HashSet<&'static str> = DATA_ACTIONS.into_iter().collect();
  static ref CONTAINER_SET: HashSet<&'static str> = CONTAINER_ACTIONS.into_iter().collect();
}

/// Ingress classification of a user action, matched by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserActionScope {
  /// Always allowed.
  Ok,
  /// Allowed unless the user has a nuanced restriction.
  Special,
  /// Allowed only to full-access users.
  Surprising,
  /// Row op, checked against table/column permissions.
  Data,
  /// Verdict requires lowering to doc actions first.
  Deferred,
}

/// A higher-level command as received from a client, prior to lowering by the
/// data engine. Kept name-plus-args shaped since the engine only classifies
/// and scans them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAction {
  pub name: String,
  pub args: Vec<Value>,
}

impl UserAction {
  pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
    return UserAction {
      name: name.into(),
      args,
    };
  }

  pub fn scope(&self) -> UserActionScope {
    let name = self.name.as_str();
    if OK_SET.contains(name) {
      return UserActionScope::Ok;
    }
    if SPECIAL_SET.contains(name) {
      return UserActionScope::Special;
    }
    if SURPRISING_SET.contains(name) {
      return UserActionScope::Surprising;
    }
    if DATA_SET.contains(name) {
      return UserActionScope::Data;
    }
    return UserActionScope::Deferred;
  }

  /// Table targeted by this action, when the first argument names one.
  pub fn table_id(&self) -> Option<&str> {
    return self.args.first().and_then(|v| v.as_str());
  }

  #[inline]
  pub fn is_container(&self) -> bool {
    return CONTAINER_SET.contains(self.name.as_str());
  }

  /// Nested actions of `ApplyUndoActions` / `ApplyDocActions`. The payload is
  /// a list of `[name, ...args]` arrays; malformed entries are skipped.
  pub fn nested(&self) -> Vec<UserAction> {
    if !self.is_container() {
      return vec![];
    }
    let Some(Value::Array(items)) = self.args.first() else {
      return vec![];
    };
    return items
      .iter()
      .filter_map(|item| {
        let arr = item.as_array()?;
        let name = arr.first()?.as_str()?;
        return Some(UserAction::new(name, arr[1..].to_vec()));
      })
      .collect();
  }

  /// Depth-first walk of this action and any nested payloads, testing
  /// `pred` against each.
  pub fn any_recursive(&self, pred: &dyn Fn(&UserAction) -> bool) -> bool {
    if pred(self) {
      return true;
    }
    return self.nested().iter().any(|a| a.any_recursive(pred));
  }
}

/// True when some action in `actions` explicitly targets an ACL table,
/// scanning through undo/doc-action containers.
pub fn has_deliberate_rule_change(actions: &[UserAction]) -> bool {
  return actions
    .iter()
    .any(|a| a.any_recursive(&|a| a.table_id().is_some_and(is_acl_table)));
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_scope_classification() {
    assert_eq!(
      UserAction::new("Calculate", vec![]).scope(),
      UserActionScope::Ok
    );
    assert_eq!(
      UserAction::new("AddView", vec![]).scope(),
      UserActionScope::Special
    );
    assert_eq!(
      UserAction::new("RemoveView", vec![]).scope(),
      UserActionScope::Surprising
    );
    assert_eq!(
      UserAction::new("BulkUpdateRecord", vec![]).scope(),
      UserActionScope::Data
    );
    assert_eq!(
      UserAction::new("AddEmptyTable", vec![]).scope(),
      UserActionScope::Deferred
    );
  }

  #[test]
  fn test_nested_scan() {
    let inner = json!([["UpdateRecord", "_grist_ACLRules", 1, {}]]);
    let actions = vec![
      UserAction::new("Calculate", vec![]),
      UserAction::new("ApplyUndoActions", vec![inner]),
    ];
    assert!(has_deliberate_rule_change(&actions));

    let actions = vec![UserAction::new(
      "UpdateRecord",
      vec![json!("Table1"), json!(1), json!({})],
    )];
    assert!(!has_deliberate_rule_change(&actions));
  }

  #[test]
  fn test_doubly_nested_scan() {
    let inner = json!([[
      "ApplyDocActions",
      [["AddRecord", "_grist_ACLResources", 5, {}]]
    ]]);
    let actions = vec![UserAction::new("ApplyDocActions", vec![inner])];
    assert!(has_deliberate_rule_change(&actions));
  }

  #[test]
  fn test_doc_action_shape_helpers() {
    let add = DocAction::BulkAddRecord {
      table_id: "T".into(),
      row_ids: vec![1, 2],
      columns: ColValues::new(),
    };
    assert!(add.is_add_like());
    assert!(add.has_cells());
    assert!(!add.is_schema_action());
    assert_eq!(add.row_ids(), vec![1, 2]);

    let rename = DocAction::RenameColumn {
      table_id: "T".into(),
      col_id: "a".into(),
      new_col_id: "b".into(),
    };
    assert!(rename.is_schema_action());
    assert!(rename.row_ids().is_empty());
  }
}

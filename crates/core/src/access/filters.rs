use serde_json::json;
use std::collections::HashSet;

use crate::access::censor::CensorshipInfo;
use crate::access::error::AccessError;
use crate::access::permission_info::PermissionInfo;
use crate::access::permissions::{Perm, PermissionBit, PermissionSetWithContext};
use crate::access::steps::ActionStep;
use crate::actions::{ColValues, DocAction, RowId};
use crate::constants::{is_structural_table, MANUAL_SORT};
use crate::doc_data::TableData;
use crate::records::RecordView;

/// How a denied verdict is handled: egress checks silently prune, ingress
/// checks abort the bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
  Check,
  Fatal,
}

/// A permission axis bound to a severity. The same pruning code serves both
/// directions; only the severity differs.
#[derive(Debug, Clone, Copy)]
pub struct AccessCheck {
  pub bit: PermissionBit,
  pub severity: Severity,
}

impl AccessCheck {
  pub fn new(bit: PermissionBit, severity: Severity) -> Self {
    return AccessCheck { bit, severity };
  }

  #[inline]
  pub fn get(&self, ps: &PermissionSetWithContext) -> Perm {
    return ps.perms.get(self.bit);
  }

  pub fn throw_if_denied(&self, ps: &PermissionSetWithContext) -> Result<(), AccessError> {
    if ps.perms.get(self.bit) == Perm::Deny {
      return Err(AccessError::deny_with_memos(
        format!("blocked by {:?} rules", self.bit),
        ps.memos.clone(),
      ));
    }
    return Ok(());
  }

  /// The verdict, erroring out on deny when fatal.
  pub fn check(&self, ps: &PermissionSetWithContext) -> Result<Perm, AccessError> {
    if self.severity == Severity::Fatal {
      self.throw_if_denied(ps)?;
    }
    return Ok(self.get(ps));
  }
}

/// The permission axis an action is checked against.
pub fn access_check_for_action(action: &DocAction, severity: Severity) -> AccessCheck {
  use DocAction::*;
  if is_structural_table(action.table_id()) {
    return AccessCheck::new(PermissionBit::SchemaEdit, severity);
  }
  let bit = match action {
    UpdateRecord { .. } | BulkUpdateRecord { .. } => PermissionBit::Update,
    RemoveRecord { .. } | BulkRemoveRecord { .. } => PermissionBit::Delete,
    AddRecord { .. } | BulkAddRecord { .. } | ReplaceTableData { .. } | TableData { .. } => {
      PermissionBit::Create
    }
    _ => PermissionBit::SchemaEdit,
  };
  return AccessCheck::new(bit, severity);
}

/// Column pruning: drop columns (or the whole action) the check denies.
/// `manualSort` is preserved unconditionally. With a fatal check, a denied
/// column aborts instead.
pub fn filter_action_columns(
  action: DocAction,
  perm_info: &PermissionInfo,
  check: &AccessCheck,
) -> Result<Option<DocAction>, AccessError> {
  let table_id = action.table_id().to_string();

  let col_allowed = |col_id: &str| -> Result<bool, AccessError> {
    if col_id == MANUAL_SORT {
      return Ok(true);
    }
    let verdict = check.check(&perm_info.get_column_access(&table_id, col_id))?;
    return Ok(verdict != Perm::Deny);
  };

  match action {
    DocAction::AddColumn { ref col_id, .. }
    | DocAction::RemoveColumn { ref col_id, .. }
    | DocAction::RenameColumn { ref col_id, .. }
    | DocAction::ModifyColumn { ref col_id, .. } => {
      if !col_allowed(col_id)? {
        return Ok(None);
      }
      return Ok(Some(action));
    }
    _ => {}
  }

  if !action.has_cells() {
    // Pure removals and table-level schema ops pass through.
    return Ok(Some(action));
  }

  let mut action = action;
  let empty = match &mut action {
    DocAction::AddRecord { columns, .. } | DocAction::UpdateRecord { columns, .. } => {
      let col_ids: Vec<String> = columns.keys().cloned().collect();
      for col_id in col_ids {
        if !col_allowed(&col_id)? {
          columns.shift_remove(&col_id);
        }
      }
      columns.is_empty()
    }
    DocAction::BulkAddRecord { columns, .. }
    | DocAction::BulkUpdateRecord { columns, .. }
    | DocAction::ReplaceTableData { columns, .. }
    | DocAction::TableData { columns, .. } => {
      let col_ids: Vec<String> = columns.keys().cloned().collect();
      for col_id in col_ids {
        if !col_allowed(&col_id)? {
          columns.shift_remove(&col_id);
        }
      }
      columns.is_empty()
    }
    _ => false,
  };

  if empty {
    return Ok(None);
  }
  return Ok(Some(action));
}

/// Keep only rows accepted by `keep`; `None` when nothing remains.
fn strip_action_rows(action: &DocAction, keep: &HashSet<RowId>) -> Option<DocAction> {
  fn strip_bulk(row_ids: &[RowId], columns: &ColValues, keep: &HashSet<RowId>) -> Option<(Vec<RowId>, ColValues)> {
    let indices: Vec<usize> = row_ids
      .iter()
      .enumerate()
      .filter(|(_, id)| keep.contains(id))
      .map(|(index, _)| index)
      .collect();
    if indices.is_empty() {
      return None;
    }
    let new_row_ids: Vec<RowId> = indices.iter().map(|i| row_ids[*i]).collect();
    let new_columns: ColValues = columns
      .iter()
      .map(|(col_id, cells)| {
        (
          col_id.clone(),
          indices.iter().map(|i| cells[*i].clone()).collect(),
        )
      })
      .collect();
    return Some((new_row_ids, new_columns));
  }

  use DocAction::*;
  return match action {
    AddRecord { row_id, .. } | UpdateRecord { row_id, .. } | RemoveRecord { row_id, .. } => {
      if keep.contains(row_id) {
        Some(action.clone())
      } else {
        None
      }
    }
    BulkAddRecord {
      table_id,
      row_ids,
      columns,
    } => strip_bulk(row_ids, columns, keep).map(|(row_ids, columns)| BulkAddRecord {
      table_id: table_id.clone(),
      row_ids,
      columns,
    }),
    BulkUpdateRecord {
      table_id,
      row_ids,
      columns,
    } => strip_bulk(row_ids, columns, keep).map(|(row_ids, columns)| BulkUpdateRecord {
      table_id: table_id.clone(),
      row_ids,
      columns,
    }),
    ReplaceTableData {
      table_id,
      row_ids,
      columns,
    } => strip_bulk(row_ids, columns, keep).map(|(row_ids, columns)| ReplaceTableData {
      table_id: table_id.clone(),
      row_ids,
      columns,
    }),
    TableData {
      table_id,
      row_ids,
      columns,
    } => strip_bulk(row_ids, columns, keep).map(|(row_ids, columns)| TableData {
      table_id: table_id.clone(),
      row_ids,
      columns,
    }),
    BulkRemoveRecord { table_id, row_ids } => {
      let row_ids: Vec<RowId> = row_ids.iter().copied().filter(|id| keep.contains(id)).collect();
      if row_ids.is_empty() {
        None
      } else {
        Some(BulkRemoveRecord {
          table_id: table_id.clone(),
          row_ids,
        })
      }
    }
    _ => Some(action.clone()),
  };
}

fn row_forbidden(
  perm_info: &PermissionInfo,
  table_id: &str,
  rows: Option<&TableData>,
  row_id: RowId,
) -> bool {
  let Some(rows) = rows else {
    return true;
  };
  let Some(rec) = RecordView::by_row_id(rows, row_id) else {
    // A row that doesn't exist in the snapshot cannot be seen.
    return true;
  };
  return perm_info.row_access(table_id, Some(rec), None).perms.read != Perm::Allow;
}

/// Row pruning for one action within one step: compares forbidden row sets
/// before and after and rewrites the action into up to three, in order
/// (synthetic add, pruned original, synthetic remove). Censored cells are
/// overwritten with `sentinel`.
pub fn filter_action_rows_for_viewer(
  step: &ActionStep,
  action: &DocAction,
  perm_info: &PermissionInfo,
  sentinel: &str,
) -> Result<Vec<DocAction>, AccessError> {
  let table_id = action.table_id().to_string();
  let rows_before = step.rows_before.as_deref();
  let rows_after = step.rows_after.as_deref();

  let mut keep: HashSet<RowId> = HashSet::new();
  let mut force_add: Vec<RowId> = vec![];
  let mut force_remove: Vec<RowId> = vec![];

  for row_id in action.row_ids() {
    let forbidden_before = row_forbidden(perm_info, &table_id, rows_before, row_id);
    let forbidden_after = row_forbidden(perm_info, &table_id, rows_after, row_id);
    match (forbidden_before, forbidden_after) {
      (true, true) => {}
      (false, false) => {
        keep.insert(row_id);
      }
      (true, false) => {
        // Row becomes visible. Adds already carry the full row.
        if action.is_add_like() {
          keep.insert(row_id);
        } else {
          force_add.push(row_id);
        }
      }
      (false, true) => {
        // Row becomes hidden. Removes already hide it.
        if action.is_remove_like() {
          keep.insert(row_id);
        } else {
          force_remove.push(row_id);
        }
      }
    }
  }

  let mut out: Vec<DocAction> = vec![];

  if !force_add.is_empty() {
    let Some(rows_after) = rows_after else {
      return Err(AccessError::Internal(format!(
        "no post-state for newly visible rows of {table_id:?}"
      )));
    };
    let mut row_ids: Vec<RowId> = vec![];
    let mut columns: ColValues = rows_after
      .columns
      .keys()
      .map(|col_id| (col_id.clone(), vec![]))
      .collect();
    for row_id in force_add {
      let Some(index) = rows_after.row_index(row_id) else {
        return Err(AccessError::Internal(format!(
          "unexpected removal of row {row_id} in {table_id:?}"
        )));
      };
      row_ids.push(row_id);
      for (col_id, cells) in &mut columns {
        cells.push(
          rows_after
            .cell(col_id, index)
            .cloned()
            .unwrap_or(serde_json::Value::Null),
        );
      }
    }
    out.push(DocAction::BulkAddRecord {
      table_id: table_id.clone(),
      row_ids,
      columns,
    });
  }

  if let Some(pruned) = strip_action_rows(action, &keep) {
    out.push(pruned);
  }

  if !force_remove.is_empty() {
    out.push(DocAction::BulkRemoveRecord {
      table_id: table_id.clone(),
      row_ids: force_remove,
    });
  }

  for action in &mut out {
    censor_cells(step, action, perm_info, sentinel);
  }
  return Ok(out);
}

/// Overwrite cells of row-dependent denied columns with the censor sentinel.
fn censor_cells(
  step: &ActionStep,
  action: &mut DocAction,
  perm_info: &PermissionInfo,
  sentinel: &str,
) {
  if !action.has_cells() {
    return;
  }
  let table_id = action.table_id().to_string();
  let rows = step.rows_after.as_deref().or(step.rows_before.as_deref());
  let Some(rows) = rows else {
    return;
  };

  // Normalize: visit (col_id, row index range) over either payload shape.
  match action {
    DocAction::AddRecord {
      row_id, columns, ..
    }
    | DocAction::UpdateRecord {
      row_id, columns, ..
    } => {
      let row_id = *row_id;
      let col_ids: Vec<String> = columns.keys().cloned().collect();
      for col_id in col_ids {
        if col_id == MANUAL_SORT {
          continue;
        }
        if perm_info.get_column_access(&table_id, &col_id).perms.read != Perm::Mixed {
          continue;
        }
        let rec = RecordView::by_row_id(rows, row_id);
        if perm_info
          .row_column_access(&table_id, &col_id, rec, None)
          .perms
          .read
          != Perm::Allow
        {
          columns[&col_id] = json!(sentinel);
        }
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
      let row_ids = row_ids.clone();
      let col_ids: Vec<String> = columns.keys().cloned().collect();
      for col_id in col_ids {
        if col_id == MANUAL_SORT {
          continue;
        }
        if perm_info.get_column_access(&table_id, &col_id).perms.read != Perm::Mixed {
          continue;
        }
        for (index, row_id) in row_ids.iter().enumerate() {
          let rec = RecordView::by_row_id(rows, *row_id);
          if perm_info
            .row_column_access(&table_id, &col_id, rec, None)
            .perms
            .read
            != Perm::Allow
          {
            columns[&col_id][index] = json!(sentinel);
          }
        }
      }
    }
    _ => {}
  }
}

/// Full egress dispatch for one step: drop, pass, column-prune, or row-prune
/// plus column-prune; then the structural censorship second pass.
pub fn filter_step_for_viewer(
  step: &ActionStep,
  perm_info: &PermissionInfo,
  can_view_access_rules: bool,
  sentinel: &str,
) -> Result<Vec<DocAction>, AccessError> {
  let action = &step.action;
  let table_id = action.table_id().to_string();
  let read_check = AccessCheck::new(PermissionBit::Read, Severity::Check);

  let table_access = perm_info.get_table_access(&table_id);
  let mut out: Vec<DocAction> = match read_check.get(&table_access) {
    Perm::Deny => vec![],
    Perm::Allow => vec![action.clone()],
    Perm::Mixed => {
      if !perm_info.rules().has_row_rules(&table_id) {
        // Only column rules disagree; no per-row work needed.
        filter_action_columns(action.clone(), perm_info, &read_check)?
          .into_iter()
          .collect()
      } else {
        let rows = filter_action_rows_for_viewer(step, action, perm_info, sentinel)?;
        let mut pruned = vec![];
        for action in rows {
          if let Some(action) = filter_action_columns(action, perm_info, &read_check)? {
            pruned.push(action);
          }
        }
        pruned
      }
    }
  };

  if is_structural_table(&table_id) {
    if let Some(ref meta) = step.meta_after {
      let censorship = CensorshipInfo::new(meta, perm_info);
      out = out
        .into_iter()
        .filter_map(|action| censorship.censor_action(action, can_view_access_rules))
        .collect();
    }
  }

  return Ok(out);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::access::permission_info::{PermissionInfo, Ruler};
  use crate::access::rules::RuleCollection;
  use crate::access::test_utils::{acl_tables, user, TestCompiler};
  use crate::constants::CENSORED_SENTINEL;
  use crate::doc_data::DocData;
  use crate::session::Role;
  use std::sync::Arc;

  fn step_for(
    action: DocAction,
    rows_before: Option<TableData>,
    rows_after: Option<TableData>,
  ) -> ActionStep {
    return ActionStep {
      action,
      rows_before: rows_before.map(Arc::new),
      rows_after: rows_after.map(Arc::new),
      meta_before: None,
      meta_after: None,
      ruler: Arc::new(Ruler::from_rules(Arc::new(RuleCollection::empty()))),
    };
  }

  fn info_for(spec: &[(&str, &str, &str, &str, &str)], role: Role) -> PermissionInfo {
    let doc = DocData::from_tables(acl_tables(spec));
    let rules = Arc::new(RuleCollection::build(&doc, &TestCompiler));
    return PermissionInfo::new(rules, user("u@x.com", Some(role)));
  }

  fn status_table(rows: &[(RowId, &str, &str)]) -> TableData {
    let mut t = TableData::new("T");
    for (id, status, note) in rows {
      t.row_ids.push(*id);
      t.columns
        .entry("status".to_string())
        .or_default()
        .push(json!(status));
      t.columns
        .entry("note".to_string())
        .or_default()
        .push(json!(note));
    }
    return t;
  }

  #[test]
  fn test_column_prune_removes_denied_column() {
    let info = info_for(
      &[("T", "secret", "user.Access != 'owners'", "-R", "")],
      Role::Editors,
    );
    let action = DocAction::BulkAddRecord {
      table_id: "T".into(),
      row_ids: vec![1, 2],
      columns: [
        ("public".to_string(), vec![json!("a"), json!("b")]),
        ("secret".to_string(), vec![json!("x"), json!("y")]),
      ]
      .into_iter()
      .collect(),
    };
    let check = AccessCheck::new(PermissionBit::Read, Severity::Check);
    let pruned = filter_action_columns(action, &info, &check).unwrap().unwrap();
    let DocAction::BulkAddRecord { columns, .. } = pruned else {
      panic!("shape change");
    };
    assert!(columns.contains_key("public"));
    assert!(!columns.contains_key("secret"));
  }

  #[test]
  fn test_column_prune_fatal_throws() {
    let info = info_for(
      &[("T", "secret", "user.Access != 'owners'", "-U", "told you so")],
      Role::Editors,
    );
    let action = DocAction::UpdateRecord {
      table_id: "T".into(),
      row_id: 1,
      columns: [("secret".to_string(), json!("v"))].into_iter().collect(),
    };
    let check = AccessCheck::new(PermissionBit::Update, Severity::Fatal);
    let err = filter_action_columns(action, &info, &check).err().unwrap();
    let AccessError::AclDeny { memos, .. } = err else {
      panic!("expected AclDeny");
    };
    assert_eq!(memos, vec!["told you so".to_string()]);
  }

  #[test]
  fn test_row_update_becomes_visible() {
    let info = info_for(
      &[
        ("T", "*", "rec.status == 'open'", "+R", ""),
        ("T", "*", "", "-R", ""),
      ],
      Role::Editors,
    );
    let action = DocAction::UpdateRecord {
      table_id: "T".into(),
      row_id: 5,
      columns: [
        ("status".to_string(), json!("open")),
        ("note".to_string(), json!("ok")),
      ]
      .into_iter()
      .collect(),
    };
    let step = step_for(
      action.clone(),
      Some(status_table(&[(5, "draft", "")])),
      Some(status_table(&[(5, "open", "ok")])),
    );
    let out = filter_action_rows_for_viewer(&step, &action, &info, CENSORED_SENTINEL).unwrap();

    assert_eq!(out.len(), 1);
    let DocAction::BulkAddRecord {
      row_ids, columns, ..
    } = &out[0]
    else {
      panic!("expected synthetic add, got {:?}", out[0]);
    };
    assert_eq!(row_ids, &vec![5]);
    assert_eq!(columns["status"], vec![json!("open")]);
    assert_eq!(columns["note"], vec![json!("ok")]);
  }

  #[test]
  fn test_row_update_becomes_hidden() {
    let info = info_for(
      &[
        ("T", "*", "rec.status == 'open'", "+R", ""),
        ("T", "*", "", "-R", ""),
      ],
      Role::Editors,
    );
    let action = DocAction::UpdateRecord {
      table_id: "T".into(),
      row_id: 7,
      columns: [("status".to_string(), json!("archived"))].into_iter().collect(),
    };
    let step = step_for(
      action.clone(),
      Some(status_table(&[(7, "open", "")])),
      Some(status_table(&[(7, "archived", "")])),
    );
    let out = filter_action_rows_for_viewer(&step, &action, &info, CENSORED_SENTINEL).unwrap();

    assert_eq!(
      out,
      vec![DocAction::BulkRemoveRecord {
        table_id: "T".into(),
        row_ids: vec![7],
      }]
    );
  }

  #[test]
  fn test_row_partition_buckets() {
    let info = info_for(
      &[
        ("T", "*", "rec.status == 'open'", "+R", ""),
        ("T", "*", "", "-R", ""),
      ],
      Role::Editors,
    );
    // Rows: 1 stays visible, 2 stays hidden, 3 becomes visible, 4 hides.
    let before = status_table(&[(1, "open", ""), (2, "x", ""), (3, "x", ""), (4, "open", "")]);
    let after = status_table(&[(1, "open", ""), (2, "x", ""), (3, "open", ""), (4, "x", "")]);
    let action = DocAction::BulkUpdateRecord {
      table_id: "T".into(),
      row_ids: vec![1, 2, 3, 4],
      columns: [(
        "status".to_string(),
        vec![json!("open"), json!("x"), json!("open"), json!("x")],
      )]
      .into_iter()
      .collect(),
    };
    let step = step_for(action.clone(), Some(before), Some(after));
    let out = filter_action_rows_for_viewer(&step, &action, &info, CENSORED_SENTINEL).unwrap();

    assert_eq!(out.len(), 3);
    // Synthetic add first, pruned original second, synthetic remove last.
    let DocAction::BulkAddRecord { row_ids, .. } = &out[0] else {
      panic!("expected add first");
    };
    assert_eq!(row_ids, &vec![3]);
    let DocAction::BulkUpdateRecord { row_ids, .. } = &out[1] else {
      panic!("expected pruned update");
    };
    assert_eq!(row_ids, &vec![1]);
    let DocAction::BulkRemoveRecord { row_ids, .. } = &out[2] else {
      panic!("expected remove last");
    };
    assert_eq!(row_ids, &vec![4]);
  }

  #[test]
  fn test_cell_censoring() {
    // Column "note" readable only on open records.
    let info = info_for(
      &[
        ("T", "note", "rec.status == 'open'", "+R", ""),
        ("T", "note", "", "-R", ""),
      ],
      Role::Editors,
    );
    let after = status_table(&[(1, "open", "hello"), (2, "draft", "private")]);
    let action = DocAction::BulkUpdateRecord {
      table_id: "T".into(),
      row_ids: vec![1, 2],
      columns: [(
        "note".to_string(),
        vec![json!("hello"), json!("private")],
      )]
      .into_iter()
      .collect(),
    };
    let step = step_for(action.clone(), Some(after.clone()), Some(after));
    let out = filter_action_rows_for_viewer(&step, &action, &info, CENSORED_SENTINEL).unwrap();

    assert_eq!(out.len(), 1);
    let DocAction::BulkUpdateRecord { columns, .. } = &out[0] else {
      panic!("shape change");
    };
    assert_eq!(columns["note"][0], json!("hello"));
    assert_eq!(columns["note"][1], json!(CENSORED_SENTINEL));

    // Hosts can substitute their own sentinel.
    let out = filter_action_rows_for_viewer(&step, &action, &info, "[hidden]").unwrap();
    let DocAction::BulkUpdateRecord { columns, .. } = &out[0] else {
      panic!("shape change");
    };
    assert_eq!(columns["note"][1], json!("[hidden]"));
  }

  #[test]
  fn test_dispatch_uniform_verdicts() {
    let deny_all = info_for(
      &[("T", "*", "user.Access != 'owners'", "-R", "")],
      Role::Editors,
    );
    let action = DocAction::AddRecord {
      table_id: "T".into(),
      row_id: 1,
      columns: [("a".to_string(), json!(1))].into_iter().collect(),
    };
    let step = step_for(action.clone(), None, Some(status_table(&[(1, "x", "")])));
    assert!(filter_step_for_viewer(&step, &deny_all, false, CENSORED_SENTINEL).unwrap().is_empty());

    let allow_all = info_for(&[], Role::Editors);
    let out = filter_step_for_viewer(&step, &allow_all, false, CENSORED_SENTINEL).unwrap();
    assert_eq!(out, vec![step.action.clone()]);
  }
}

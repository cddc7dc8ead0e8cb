use log::*;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::access::error::AccessError;
use crate::access::permission_info::Ruler;
use crate::access::rules::RuleCompiler;
use crate::actions::{DocAction, RowId};
use crate::constants::{is_acl_table, is_structural_table, STRUCTURAL_TABLES};
use crate::doc_data::{DocData, RowSource, TableData, TableQuery, TableReader};

/// Copy-on-write snapshot of the structural tables. Applying an action
/// shares the top-level map and replaces only the mutated table.
#[derive(Clone, Default)]
pub struct MetaSnapshot {
  tables: HashMap<String, Arc<TableData>>,
}

impl MetaSnapshot {
  /// Seed from the live document's structural tables.
  pub fn from_doc(doc: &DocData) -> Self {
    let mut tables = HashMap::new();
    for table_id in STRUCTURAL_TABLES {
      if let Some(table) = doc.get_table(table_id) {
        tables.insert(table_id.to_string(), Arc::new(table.clone()));
      }
    }
    return MetaSnapshot { tables };
  }

  /// Seed from an explicit table set, keeping only structural tables.
  pub fn from_tables(tables: impl IntoIterator<Item = TableData>) -> Self {
    return MetaSnapshot {
      tables: tables
        .into_iter()
        .filter(|t| is_structural_table(&t.table_id))
        .map(|t| (t.table_id.clone(), Arc::new(t)))
        .collect(),
    };
  }

  /// Apply one structural-table action, deep-copying only the affected
  /// table. Non-structural actions return the snapshot unchanged.
  pub fn apply(&self, action: &DocAction) -> MetaSnapshot {
    let table_id = action.table_id();
    if !is_structural_table(table_id) {
      return self.clone();
    }

    let mut scratch = DocData::new();
    if let Some(table) = self.tables.get(table_id) {
      scratch.load_table((**table).clone());
    }
    scratch.receive_action(action);

    let mut next = self.clone();
    match scratch.get_table(table_id) {
      Some(table) => {
        next.tables.insert(table_id.to_string(), Arc::new(table.clone()));
      }
      None => {
        next.tables.remove(table_id);
      }
    }
    return next;
  }
}

impl TableReader for MetaSnapshot {
  fn table(&self, table_id: &str) -> Option<&TableData> {
    return self.tables.get(table_id).map(|t| t.as_ref());
  }
}

/// One action of a bundle with the before/after state the downstream
/// filters need.
pub struct ActionStep {
  pub action: DocAction,
  pub rows_before: Option<Arc<TableData>>,
  pub rows_after: Option<Arc<TableData>>,
  pub meta_before: Option<MetaSnapshot>,
  pub meta_after: Option<MetaSnapshot>,
  /// Rule state in effect at this step: produced by all rule changes
  /// strictly before it, with adjacent ACL-table edits batched.
  pub ruler: Arc<Ruler>,
}

/// The last post-state snapshot of `table_id` across the remainder of the
/// bundle, used to resolve `newRec`. Aliases row ids if an id is removed and
/// re-added within one bundle, and does not chase column renames; kept
/// as-is for compatibility.
pub fn last_rows_for_table<'a>(
  steps: &'a [ActionStep],
  from: usize,
  table_id: &str,
) -> Option<&'a Arc<TableData>> {
  return steps[from..]
    .iter()
    .rev()
    .find_map(|step| match &step.rows_after {
      Some(rows) if rows.table_id == table_id => Some(rows),
      _ => None,
    });
}

/// Materializes [ActionStep]s for a bundle.
pub struct StepBuilder<'a> {
  pub row_source: &'a dyn RowSource,
  pub compiler: &'a dyn RuleCompiler,
}

impl StepBuilder<'_> {
  /// Build the step sequence for `doc_actions`. With `applied` set, the
  /// bundle is already committed and `undo` is replayed in reverse to rewind
  /// the fetched state to the pre-bundle snapshot. `seed_meta` is the live
  /// document's structural snapshot, taken synchronously by the caller.
  pub async fn build(
    &self,
    doc_actions: &[DocAction],
    undo: &[DocAction],
    applied: bool,
    seed_meta: MetaSnapshot,
    base_ruler: Arc<Ruler>,
  ) -> Result<Vec<ActionStep>, AccessError> {
    let result = self
      .build_impl(doc_actions, undo, applied, seed_meta, base_ruler)
      .await;
    if let Err(ref err) = result {
      error!("step construction failed: {err}");
    }
    return result;
  }

  async fn build_impl(
    &self,
    doc_actions: &[DocAction],
    undo: &[DocAction],
    applied: bool,
    seed_meta: MetaSnapshot,
    base_ruler: Arc<Ruler>,
  ) -> Result<Vec<ActionStep>, AccessError> {
    // Which rows of which tables the bundle touches, including via undo.
    let related_rows = related_rows(doc_actions.iter().chain(undo.iter()));

    let mut scratch = DocData::new();
    for (table_id, row_ids) in &related_rows {
      let query = TableQuery::by_row_ids(table_id.clone(), row_ids.iter().copied());
      let data = self
        .row_source
        .fetch_query(&query)
        .await
        .map_err(|err| AccessError::Internal(format!("fetch {table_id:?}: {err}")))?;
      scratch.sync_table(&data);
    }

    let structural = doc_actions
      .iter()
      .any(|a| a.is_schema_action() || is_structural_table(a.table_id()));
    let mut meta: Option<MetaSnapshot> = structural.then_some(seed_meta);

    if applied {
      for action in undo.iter().rev() {
        scratch.receive_action(action);
        if let Some(current) = meta.take() {
          meta = Some(current.apply(action));
        }
      }
    }

    let mut steps = Vec::with_capacity(doc_actions.len());
    let mut ruler = base_ruler;
    let mut replace_ruler = false;

    for action in doc_actions {
      let table_id = action.table_id().to_string();

      // A run of ACL-table edits (rules plus resources) is treated as one
      // change: the ruler is rebuilt only once the run ends, so predicates
      // never see a half-applied rule set.
      if replace_ruler && !is_acl_table(&table_id) {
        if let Some(ref meta) = meta {
          ruler = Arc::new(Ruler::new(meta, self.compiler));
        }
        replace_ruler = false;
      }

      let rows_before = scratch.get_table(&table_id).map(|t| Arc::new(t.clone()));
      let meta_before = meta.clone();

      scratch.receive_action(action);
      if let Some(current) = meta.take() {
        meta = Some(current.apply(action));
      }

      let rows_after = match scratch.get_table(&table_id) {
        Some(table) => Some(Arc::new(table.clone())),
        // Table gone (removed or renamed): reuse the before-snapshot.
        None => rows_before.clone(),
      };

      if is_acl_table(&table_id) {
        replace_ruler = true;
      }

      steps.push(ActionStep {
        action: action.clone(),
        rows_before,
        rows_after,
        meta_before,
        meta_after: meta.clone(),
        ruler: ruler.clone(),
      });
    }

    return Ok(steps);
  }
}

fn related_rows<'a>(
  actions: impl Iterator<Item = &'a DocAction>,
) -> HashMap<String, BTreeSet<RowId>> {
  let mut related: HashMap<String, BTreeSet<RowId>> = HashMap::new();
  for action in actions {
    let row_ids = action.row_ids();
    if row_ids.is_empty() {
      continue;
    }
    related
      .entry(action.table_id().to_string())
      .or_default()
      .extend(row_ids);
  }
  return related;
}

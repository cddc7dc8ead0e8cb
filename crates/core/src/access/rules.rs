use log::*;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::access::permissions::{PartialPermissionSet, Perm, PermissionBit, RuleType};
use crate::access::user::UserInfo;
use crate::actions::RowId;
use crate::constants::{
  ACL_RESOURCES_TABLE, ACL_RULES_TABLE, COLUMNS_TABLE, SPECIAL_ACCESS_RULES, SPECIAL_FULL_COPIES,
  SPECIAL_RESOURCE, TABLES_TABLE,
};
use crate::doc_data::TableReader;
use crate::records::RecordView;

/// Inputs a compiled rule predicate may reference.
pub struct EvalContext<'a> {
  pub user: &'a UserInfo,
  pub rec: Option<RecordView<'a>>,
  pub new_rec: Option<RecordView<'a>>,
}

pub type Predicate = Arc<dyn Fn(&EvalContext) -> Result<bool, String> + Send + Sync>;

/// A compiled rule formula: the predicate plus whether it references
/// `rec`/`newRec` (and thus needs a concrete row to evaluate).
#[derive(Clone)]
pub struct CompiledFormula {
  pub predicate: Predicate,
  pub uses_rec: bool,
}

impl CompiledFormula {
  /// The always-true formula used for empty rule formulas and implicit
  /// defaults.
  pub fn always() -> Self {
    return CompiledFormula {
      predicate: Arc::new(|_ctx| Ok(true)),
      uses_rec: false,
    };
  }

  /// Built-in owner check backing the implicit default rules.
  fn owner_only() -> Self {
    return CompiledFormula {
      predicate: Arc::new(|ctx| {
        Ok(matches!(ctx.user.access, Some(crate::session::Role::Owners)))
      }),
      uses_rec: false,
    };
  }
}

/// The rule-language compiler, injected by the host. Out of scope here; it
/// turns a formula text into a predicate over `{user, rec, newRec}`.
pub trait RuleCompiler: Send + Sync {
  fn compile(&self, formula: &str) -> Result<CompiledFormula, String>;
}

/// One compiled access rule.
#[derive(Clone)]
pub struct AclRule {
  pub formula: String,
  pub compiled: CompiledFormula,
  pub permissions: PartialPermissionSet,
  pub memo: Option<String>,
}

impl AclRule {
  fn unconditional(permissions: PartialPermissionSet) -> Self {
    return AclRule {
      formula: String::new(),
      compiled: CompiledFormula::always(),
      permissions,
      memo: None,
    };
  }

  /// True when this rule can set some bit to deny.
  pub fn denies_anything(&self) -> bool {
    use crate::access::permissions::ALL_BITS;
    return ALL_BITS
      .iter()
      .any(|bit| self.permissions.get(*bit) == Some(Perm::Deny));
  }
}

/// Column scope of a rule resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColScope {
  All,
  Cols(Vec<String>),
}

impl ColScope {
  pub fn contains(&self, col_id: &str) -> bool {
    return match self {
      ColScope::All => true,
      ColScope::Cols(cols) => cols.iter().any(|c| c == col_id),
    };
  }
}

/// Ordered rules for one resource, already spliced with the table's default
/// rules and the implicit defaults, so evaluation is a single pass.
#[derive(Clone)]
pub struct RuleSet {
  pub table_id: String,
  pub scope: ColScope,
  pub rule_type: RuleType,
  pub rules: Vec<AclRule>,
}

impl RuleSet {
  pub fn has_row_rules(&self) -> bool {
    return self.rules.iter().any(|r| r.compiled.uses_rec);
  }
}

/// A user-attribute rule: attach `user.<name>` from a lookup of `table_id`
/// where `lookup_col_id` equals the user's `char_id` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UserAttributeRule {
  pub name: String,
  #[serde(rename = "tableId")]
  pub table_id: String,
  #[serde(rename = "lookupColId")]
  pub lookup_col_id: String,
  #[serde(rename = "charId")]
  pub char_id: String,
}

/// All compiled rules of a document, bucketed by resource. Construction
/// never fails; malformed input is surfaced through [RuleCollection::rule_error]
/// so the engine can fail gracefully when a user is resolved.
pub struct RuleCollection {
  /// Per-table default rule set (resource colIds = "*").
  table_defaults: HashMap<String, RuleSet>,
  /// Column-scoped rule sets per table.
  column_sets: HashMap<String, Vec<RuleSet>>,
  /// Special, non-table rule sets ("AccessRules", "FullCopies").
  special: HashMap<String, RuleSet>,
  user_attr_rules: Vec<UserAttributeRule>,
  /// Number of user-authored rules (implicit defaults excluded).
  user_rule_count: usize,
  rule_error: Option<String>,
}

/// Implicit tail appended to every table rule set: owners keep everything,
/// everyone else keeps data access but not schema edits.
fn default_tail() -> Vec<AclRule> {
  let owner_rule = AclRule {
    formula: String::new(),
    compiled: CompiledFormula::owner_only(),
    permissions: PartialPermissionSet::uniform(Perm::Allow),
    memo: None,
  };
  let mut everyone = PartialPermissionSet::default();
  everyone.set(PermissionBit::Read, Perm::Allow);
  everyone.set(PermissionBit::Update, Perm::Allow);
  everyone.set(PermissionBit::Create, Perm::Allow);
  everyone.set(PermissionBit::Delete, Perm::Allow);
  everyone.set(PermissionBit::SchemaEdit, Perm::Deny);
  return vec![owner_rule, AclRule::unconditional(everyone)];
}

/// Rule set for a table no rule resource targets: the implicit defaults
/// alone.
pub(crate) fn default_rule_set(table_id: &str) -> RuleSet {
  return RuleSet {
    table_id: table_id.to_string(),
    scope: ColScope::All,
    rule_type: RuleType::Table,
    rules: default_tail(),
  };
}

/// Rule set for a special resource with no user-authored rules: owners only.
pub(crate) fn special_default_rule_set() -> RuleSet {
  return RuleSet {
    table_id: SPECIAL_RESOURCE.to_string(),
    scope: ColScope::All,
    rule_type: RuleType::Special,
    rules: special_tail(),
  };
}

/// Implicit tail for special resources: owners only.
fn special_tail() -> Vec<AclRule> {
  let owner_rule = AclRule {
    formula: String::new(),
    compiled: CompiledFormula::owner_only(),
    permissions: PartialPermissionSet::uniform(Perm::Allow),
    memo: None,
  };
  return vec![
    owner_rule,
    AclRule::unconditional(PartialPermissionSet::uniform(Perm::Deny)),
  ];
}

struct RawResource {
  table_id: String,
  col_ids: String,
}

impl RuleCollection {
  /// An empty collection: no rules, every viewer falls through to the
  /// implicit defaults.
  pub fn empty() -> Self {
    return RuleCollection {
      table_defaults: HashMap::new(),
      column_sets: HashMap::new(),
      special: HashMap::new(),
      user_attr_rules: vec![],
      user_rule_count: 0,
      rule_error: None,
    };
  }

  /// Build from the structural rule tables of `doc`, compiling every formula
  /// through `compiler`.
  pub fn build(doc: &dyn TableReader, compiler: &dyn RuleCompiler) -> Self {
    let mut collection = RuleCollection::empty();

    let resources = read_resources(doc);

    let Some(rules_table) = doc.table(ACL_RULES_TABLE) else {
      return collection;
    };

    // Rows ordered by rulePos; order is what makes first-wins merging
    // deterministic.
    let mut order: Vec<usize> = (0..rules_table.len()).collect();
    order.sort_by(|a, b| {
      let pos_a = rules_table
        .cell("rulePos", *a)
        .and_then(|v| v.as_f64())
        .unwrap_or(f64::MAX);
      let pos_b = rules_table
        .cell("rulePos", *b)
        .and_then(|v| v.as_f64())
        .unwrap_or(f64::MAX);
      return pos_a
        .partial_cmp(&pos_b)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then(rules_table.row_ids[*a].cmp(&rules_table.row_ids[*b]));
    });

    // Raw, per-resource rule lists prior to splicing.
    let mut table_rules: HashMap<String, Vec<AclRule>> = HashMap::new();
    let mut col_rules: Vec<(String, Vec<String>, Vec<AclRule>)> = vec![];
    let mut special_rules: HashMap<String, Vec<AclRule>> = HashMap::new();

    for index in order {
      let cell_str = |col: &str| -> String {
        return rules_table
          .cell(col, index)
          .and_then(|v| v.as_str())
          .unwrap_or("")
          .to_string();
      };

      let user_attributes = cell_str("userAttributes");
      if !user_attributes.is_empty() {
        match serde_json::from_str::<UserAttributeRule>(&user_attributes) {
          Ok(rule) => {
            collection.user_rule_count += 1;
            collection.user_attr_rules.push(rule);
          }
          Err(err) => {
            collection.note_error(format!("invalid user attribute rule: {err}"));
          }
        }
        continue;
      }

      let resource_ref = rules_table
        .cell("resource", index)
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
      let Some(resource) = resources.get(&resource_ref) else {
        collection.note_error(format!("rule references unknown resource {resource_ref}"));
        continue;
      };

      let formula = cell_str("aclFormula");
      let compiled = if formula.is_empty() {
        CompiledFormula::always()
      } else {
        match compiler.compile(&formula) {
          Ok(compiled) => compiled,
          Err(err) => {
            collection.note_error(format!("cannot compile {formula:?}: {err}"));
            continue;
          }
        }
      };

      let permissions = match PartialPermissionSet::parse(&cell_str("permissionsText")) {
        Ok(permissions) => permissions,
        Err(err) => {
          collection.note_error(err);
          continue;
        }
      };

      let memo = cell_str("memo");
      let rule = AclRule {
        formula,
        compiled,
        permissions,
        memo: if memo.is_empty() { None } else { Some(memo) },
      };
      collection.user_rule_count += 1;

      if resource.table_id == SPECIAL_RESOURCE {
        let name = resource.col_ids.clone();
        if name != SPECIAL_ACCESS_RULES && name != SPECIAL_FULL_COPIES {
          collection.note_error(format!("unknown special resource {name:?}"));
          continue;
        }
        special_rules.entry(name).or_default().push(rule);
      } else if resource.col_ids == "*" {
        table_rules
          .entry(resource.table_id.clone())
          .or_default()
          .push(rule);
      } else {
        let cols: Vec<String> = resource
          .col_ids
          .split(',')
          .map(|c| c.trim().to_string())
          .filter(|c| !c.is_empty())
          .collect();
        col_rules.push((resource.table_id.clone(), cols, vec![rule]));
      }
    }

    // Splice: every set carries the table's own rules followed by the
    // implicit defaults, so evaluating any single set is conclusive.
    let tables: HashSet<String> = table_rules
      .keys()
      .cloned()
      .chain(col_rules.iter().map(|(t, _, _)| t.clone()))
      .collect();
    for table_id in tables {
      let own = table_rules.remove(&table_id).unwrap_or_default();
      let mut tail = own.clone();
      tail.extend(default_tail());

      for (col_table, cols, rules) in &col_rules {
        if *col_table != table_id {
          continue;
        }
        let mut spliced = rules.clone();
        spliced.extend(tail.iter().cloned());
        collection
          .column_sets
          .entry(table_id.clone())
          .or_default()
          .push(RuleSet {
            table_id: table_id.clone(),
            scope: ColScope::Cols(cols.clone()),
            rule_type: RuleType::Column,
            rules: spliced,
          });
      }

      collection.table_defaults.insert(
        table_id.clone(),
        RuleSet {
          table_id: table_id.clone(),
          scope: ColScope::All,
          rule_type: RuleType::Table,
          rules: tail,
        },
      );
    }

    for (name, mut rules) in special_rules {
      rules.extend(special_tail());
      collection.special.insert(
        name.clone(),
        RuleSet {
          table_id: SPECIAL_RESOURCE.to_string(),
          scope: ColScope::Cols(vec![name]),
          rule_type: RuleType::Special,
          rules,
        },
      );
    }

    return collection;
  }

  fn note_error(&mut self, message: String) {
    warn!("rule collection: {message}");
    if self.rule_error.is_none() {
      self.rule_error = Some(message);
    }
  }

  /// True when the document has any user-authored rules at all.
  pub fn have_rules(&self) -> bool {
    return self.user_rule_count > 0;
  }

  pub fn rule_error(&self) -> Option<&str> {
    return self.rule_error.as_deref();
  }

  pub fn user_attribute_rules(&self) -> &[UserAttributeRule] {
    return &self.user_attr_rules;
  }

  /// Tables feeding user attributes; mutations to these invalidate cached
  /// attribute lookups.
  pub fn user_attr_source_tables(&self) -> HashSet<String> {
    return self
      .user_attr_rules
      .iter()
      .map(|r| r.table_id.clone())
      .collect();
  }

  /// The table-default rule set for `table_id`, if any rules target it.
  pub fn table_default(&self, table_id: &str) -> Option<&RuleSet> {
    return self.table_defaults.get(table_id);
  }

  pub fn column_rule_sets(&self, table_id: &str) -> &[RuleSet] {
    return self
      .column_sets
      .get(table_id)
      .map(|sets| sets.as_slice())
      .unwrap_or(&[]);
  }

  /// The rule set governing `(table_id, col_id)`: the column-scoped set if
  /// one names the column, else the table default.
  pub fn rule_set_for_column(&self, table_id: &str, col_id: &str) -> Option<&RuleSet> {
    if let Some(set) = self
      .column_rule_sets(table_id)
      .iter()
      .find(|set| set.scope.contains(col_id))
    {
      return Some(set);
    }
    return self.table_default(table_id);
  }

  pub fn special_rule_set(&self, name: &str) -> Option<&RuleSet> {
    return self.special.get(name);
  }

  /// Any rule on `table_id` whose predicate reads the record, i.e. verdicts
  /// can vary per row.
  pub fn has_row_rules(&self, table_id: &str) -> bool {
    if let Some(set) = self.table_default(table_id) {
      if set.has_row_rules() {
        return true;
      }
    }
    return self
      .column_rule_sets(table_id)
      .iter()
      .any(|set| set.has_row_rules());
  }

  pub fn tables_with_rules(&self) -> HashSet<&str> {
    return self
      .table_defaults
      .keys()
      .map(|k| k.as_str())
      .chain(self.column_sets.keys().map(|k| k.as_str()))
      .collect();
  }

  /// Structural cross-check: every resource must reference a live table and
  /// column. Run against a sandbox before committing rule changes so a
  /// broken reference cannot force recovery mode.
  pub fn check_doc_entities(&self, doc: &dyn TableReader) -> Result<(), String> {
    let tables = doc.table(TABLES_TABLE);
    let columns = doc.table(COLUMNS_TABLE);

    let table_row_id = |table_id: &str| -> Option<RowId> {
      let tables = tables?;
      let cells = tables.columns.get("tableId")?;
      let index = cells.iter().position(|v| v.as_str() == Some(table_id))?;
      return Some(tables.row_ids[index]);
    };
    let has_column = |table_row: RowId, col_id: &str| -> bool {
      let Some(columns) = columns else {
        return false;
      };
      let (Some(parents), Some(col_ids)) = (
        columns.columns.get("parentId"),
        columns.columns.get("colId"),
      ) else {
        return false;
      };
      return parents
        .iter()
        .zip(col_ids.iter())
        .any(|(parent, col)| parent.as_i64() == Some(table_row) && col.as_str() == Some(col_id));
    };

    let mut check_scope = |table_id: &str, scope: &ColScope| -> Result<(), String> {
      let Some(table_row) = table_row_id(table_id) else {
        return Err(format!("rule resource references unknown table {table_id:?}"));
      };
      if let ColScope::Cols(cols) = scope {
        for col in cols {
          if !has_column(table_row, col) {
            return Err(format!(
              "rule resource references unknown column {table_id:?}.{col:?}"
            ));
          }
        }
      }
      return Ok(());
    };

    for set in self.table_defaults.values() {
      check_scope(&set.table_id, &set.scope)?;
    }
    for sets in self.column_sets.values() {
      for set in sets {
        check_scope(&set.table_id, &set.scope)?;
      }
    }
    for rule in &self.user_attr_rules {
      let Some(table_row) = table_row_id(&rule.table_id) else {
        return Err(format!(
          "user attribute {:?} references unknown table {:?}",
          rule.name, rule.table_id
        ));
      };
      if !has_column(table_row, &rule.lookup_col_id) {
        return Err(format!(
          "user attribute {:?} references unknown column {:?}.{:?}",
          rule.name, rule.table_id, rule.lookup_col_id
        ));
      }
    }
    return Ok(());
  }
}

fn read_resources(doc: &dyn TableReader) -> HashMap<RowId, RawResource> {
  let mut resources = HashMap::new();
  let Some(table) = doc.table(ACL_RESOURCES_TABLE) else {
    return resources;
  };
  for (index, row_id) in table.row_ids.iter().enumerate() {
    let table_id = table
      .cell("tableId", index)
      .and_then(|v| v.as_str())
      .unwrap_or("")
      .to_string();
    let col_ids = table
      .cell("colIds", index)
      .and_then(|v| v.as_str())
      .unwrap_or("*")
      .to_string();
    resources.insert(*row_id, RawResource { table_id, col_ids });
  }
  return resources;
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::access::test_utils::{acl_tables, meta_tables, TestCompiler};
  use crate::doc_data::DocData;

  #[test]
  fn test_build_buckets_by_resource() {
    let doc = DocData::from_tables(acl_tables(&[
      // (resource table, resource cols, formula, permissions, memo)
      ("T", "*", "user.Email == 'boss@x.com'", "+R", ""),
      ("T", "secret", "", "-R", "hands off"),
      ("*SPECIAL", "FullCopies", "user.Email == 'boss@x.com'", "+R", ""),
    ]));
    let rules = RuleCollection::build(&doc, &TestCompiler);

    assert!(rules.rule_error().is_none());
    assert!(rules.have_rules());
    assert!(rules.table_default("T").is_some());
    assert_eq!(rules.column_rule_sets("T").len(), 1);
    assert!(rules.special_rule_set(SPECIAL_FULL_COPIES).is_some());
    assert!(rules.special_rule_set(SPECIAL_ACCESS_RULES).is_none());

    // Column set answers for its column, falls back for others.
    let set = rules.rule_set_for_column("T", "secret").unwrap();
    assert_eq!(set.rule_type, RuleType::Column);
    let set = rules.rule_set_for_column("T", "public").unwrap();
    assert_eq!(set.rule_type, RuleType::Table);
  }

  #[test]
  fn test_row_rule_detection() {
    let doc = DocData::from_tables(acl_tables(&[(
      "T",
      "*",
      "rec.status == 'open'",
      "+R",
      "",
    )]));
    let rules = RuleCollection::build(&doc, &TestCompiler);
    assert!(rules.has_row_rules("T"));
    assert!(!rules.has_row_rules("Other"));
  }

  #[test]
  fn test_bad_formula_sets_rule_error() {
    let doc = DocData::from_tables(acl_tables(&[("T", "*", "not parseable ((", "+R", "")]));
    let rules = RuleCollection::build(&doc, &TestCompiler);
    assert!(rules.rule_error().is_some());
  }

  #[test]
  fn test_check_doc_entities() {
    let mut tables = acl_tables(&[("T", "secret", "", "-R", "")]);
    tables.extend(meta_tables(&[("T", &["public", "secret"])]));
    let doc = DocData::from_tables(tables);
    let rules = RuleCollection::build(&doc, &TestCompiler);
    assert!(rules.check_doc_entities(&doc).is_ok());

    // Same rules against a doc without the column.
    let mut tables = acl_tables(&[("T", "secret", "", "-R", "")]);
    tables.extend(meta_tables(&[("T", &["public"])]));
    let doc = DocData::from_tables(tables);
    let rules = RuleCollection::build(&doc, &TestCompiler);
    assert!(rules.check_doc_entities(&doc).is_err());
  }
}

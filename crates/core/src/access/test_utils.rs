//! Shared fixtures for access-engine tests: canned structural tables, a
//! tiny comparison-only rule compiler, and in-memory fakes for the injected
//! collaborator traits.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::rules::{CompiledFormula, RuleCompiler};
use crate::access::user::{HomeDb, UserInfo, UserProfile};
use crate::actions::RowValues;
use crate::constants::{
  ACL_RESOURCES_TABLE, ACL_RULES_TABLE, COLUMNS_TABLE, FIELDS_TABLE, SECTIONS_TABLE, TABLES_TABLE,
  VIEWS_TABLE,
};
use crate::doc_data::{DocData, RowSource, TableData, TableQuery};
use crate::session::{Broadcaster, DocSession, DocUpdateMessage, Role};

/// Compiles `user.<path> == <literal>`, `rec.<col> != <literal>`,
/// `newRec.<col> == <literal>` and `true`. Enough to exercise every
/// row/column scenario without dragging in a real rule language.
pub struct TestCompiler;

fn parse_literal(text: &str) -> Result<Value, String> {
  if let Some(stripped) = text.strip_prefix('\'') {
    let Some(stripped) = stripped.strip_suffix('\'') else {
      return Err(format!("unterminated string literal: {text:?}"));
    };
    return Ok(Value::from(stripped));
  }
  return serde_json::from_str(text).map_err(|err| format!("bad literal {text:?}: {err}"));
}

impl RuleCompiler for TestCompiler {
  fn compile(&self, formula: &str) -> Result<CompiledFormula, String> {
    let formula = formula.trim();
    if formula.eq_ignore_ascii_case("true") {
      return Ok(CompiledFormula::always());
    }

    let (negated, lhs, rhs) = if let Some((lhs, rhs)) = formula.split_once("!=") {
      (true, lhs, rhs)
    } else if let Some((lhs, rhs)) = formula.split_once("==") {
      (false, lhs, rhs)
    } else {
      return Err(format!("unsupported formula: {formula:?}"));
    };

    let subject = lhs.trim().to_string();
    let literal = parse_literal(rhs.trim())?;
    let uses_rec = subject.starts_with("rec.") || subject.starts_with("newRec.");
    if !uses_rec && !subject.starts_with("user.") {
      return Err(format!("unknown subject in formula: {subject:?}"));
    }

    let predicate = move |ctx: &crate::access::rules::EvalContext<'_>| -> Result<bool, String> {
      let value = if let Some(path) = subject.strip_prefix("user.") {
        ctx.user.get_path(path).unwrap_or(Value::Null)
      } else if let Some(col) = subject.strip_prefix("rec.") {
        let rec = ctx.rec.ok_or_else(|| "rec is not available".to_string())?;
        rec.get(col).cloned().unwrap_or(Value::Null)
      } else {
        let col = subject.strip_prefix("newRec.").unwrap();
        let rec = ctx
          .new_rec
          .ok_or_else(|| "newRec is not available".to_string())?;
        rec.get(col).cloned().unwrap_or(Value::Null)
      };
      let eq = value == literal;
      return Ok(if negated { !eq } else { eq });
    };

    return Ok(CompiledFormula {
      predicate: Arc::new(predicate),
      uses_rec,
    });
  }
}

pub fn user(email: &str, access: Option<Role>) -> Arc<UserInfo> {
  return Arc::new(UserInfo {
    access,
    user_id: 1,
    email: email.to_string(),
    name: String::new(),
    origin: None,
    link_key: HashMap::new(),
    attributes: HashMap::new(),
  });
}

pub fn session_with_links(
  session_id: u64,
  email: &str,
  access: Option<Role>,
  links: &[(&str, &str)],
) -> DocSession {
  return DocSession {
    session_id,
    user_id: session_id as i64,
    email: email.to_string(),
    name: String::new(),
    access,
    origin: None,
    link_parameters: links
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect(),
  };
}

pub fn session(session_id: u64, email: &str, access: Option<Role>) -> DocSession {
  return session_with_links(session_id, email, access, &[]);
}

/// Build the two ACL tables from `(tableId, colIds, formula, permissions,
/// memo)` tuples. Row `i + 1` of the resource table backs rule `i + 1`.
pub fn acl_tables(specs: &[(&str, &str, &str, &str, &str)]) -> Vec<TableData> {
  let mut resources = TableData::new(ACL_RESOURCES_TABLE);
  resources.columns.insert("tableId".into(), vec![]);
  resources.columns.insert("colIds".into(), vec![]);

  let mut rules = TableData::new(ACL_RULES_TABLE);
  for col in [
    "resource",
    "aclFormula",
    "permissionsText",
    "userAttributes",
    "memo",
    "rulePos",
  ] {
    rules.columns.insert(col.into(), vec![]);
  }

  for (index, (table_id, col_ids, formula, permissions, memo)) in specs.iter().enumerate() {
    let row_id = (index + 1) as i64;
    resources.row_ids.push(row_id);
    resources.columns["tableId"].push(json!(table_id));
    resources.columns["colIds"].push(json!(col_ids));

    rules.row_ids.push(row_id);
    rules.columns["resource"].push(json!(row_id));
    rules.columns["aclFormula"].push(json!(formula));
    rules.columns["permissionsText"].push(json!(permissions));
    rules.columns["userAttributes"].push(json!(""));
    rules.columns["memo"].push(json!(memo));
    rules.columns["rulePos"].push(json!(row_id));
  }

  return vec![resources, rules];
}

/// ACL tables carrying a single user-attribute rule.
pub fn attr_rule_tables(
  name: &str,
  table_id: &str,
  lookup_col_id: &str,
  char_id: &str,
) -> Vec<TableData> {
  let mut tables = acl_tables(&[]);
  let rules = &mut tables[1];
  rules.row_ids.push(1);
  rules.columns["resource"].push(json!(0));
  rules.columns["aclFormula"].push(json!(""));
  rules.columns["permissionsText"].push(json!(""));
  rules.columns["userAttributes"].push(json!(
    serde_json::to_string(&json!({
      "name": name,
      "tableId": table_id,
      "lookupColId": lookup_col_id,
      "charId": char_id,
    }))
    .unwrap()
  ));
  rules.columns["memo"].push(json!(""));
  rules.columns["rulePos"].push(json!(1));
  return tables;
}

/// A single AddRecord-able rule/resource row pair, for bundles that edit
/// rules mid-flight. The resource lands at row 10, the rule references it.
pub fn acl_rule_row(
  table_id: &str,
  col_ids: &str,
  formula: &str,
  permissions: &str,
) -> (RowValues, RowValues) {
  let rule: RowValues = [
    ("resource".to_string(), json!(10)),
    ("aclFormula".to_string(), json!(formula)),
    ("permissionsText".to_string(), json!(permissions)),
    ("userAttributes".to_string(), json!("")),
    ("memo".to_string(), json!("")),
    ("rulePos".to_string(), json!(1)),
  ]
  .into_iter()
  .collect();
  let resource: RowValues = [
    ("tableId".to_string(), json!(table_id)),
    ("colIds".to_string(), json!(col_ids)),
  ]
  .into_iter()
  .collect();
  return (rule, resource);
}

/// Minimal `_grist_Tables` / `_grist_Tables_column` pair from
/// `(tableId, columns)` specs.
pub fn meta_tables(specs: &[(&str, &[&str])]) -> Vec<TableData> {
  let mut tables = TableData::new(TABLES_TABLE);
  tables.columns.insert("tableId".into(), vec![]);
  let mut columns = TableData::new(COLUMNS_TABLE);
  columns.columns.insert("parentId".into(), vec![]);
  columns.columns.insert("colId".into(), vec![]);

  let mut next_col_row = 1;
  for (index, (table_id, cols)) in specs.iter().enumerate() {
    let table_row = (index + 1) as i64;
    tables.row_ids.push(table_row);
    tables.columns["tableId"].push(json!(table_id));
    for col in *cols {
      columns.row_ids.push(next_col_row);
      columns.columns["parentId"].push(json!(table_row));
      columns.columns["colId"].push(json!(col));
      next_col_row += 1;
    }
  }
  return vec![tables, columns];
}

/// Full structural fixture: tables A (row 1) and B (row 2), two columns
/// each plus B's manualSort, one view/section/field per table.
pub fn structural_fixture() -> Vec<TableData> {
  let mut tables = TableData::new(TABLES_TABLE);
  tables.row_ids = vec![1, 2];
  tables
    .columns
    .insert("tableId".into(), vec![json!("A"), json!("B")]);

  let mut columns = TableData::new(COLUMNS_TABLE);
  columns.row_ids = vec![11, 12, 21, 22, 23];
  columns.columns.insert(
    "parentId".into(),
    vec![json!(1), json!(1), json!(2), json!(2), json!(2)],
  );
  columns.columns.insert(
    "colId".into(),
    vec![
      json!("a1"),
      json!("a2"),
      json!("b1"),
      json!("b2"),
      json!("manualSort"),
    ],
  );
  columns.columns.insert(
    "label".into(),
    vec![
      json!("A1"),
      json!("A2"),
      json!("B1"),
      json!("B2"),
      json!("manualSort"),
    ],
  );
  columns.columns.insert(
    "widgetOptions".into(),
    vec![json!("{}"), json!("{}"), json!("{}"), json!("{}"), json!("")],
  );
  columns.columns.insert(
    "formula".into(),
    vec![json!(""), json!(""), json!(""), json!(""), json!("")],
  );
  columns.columns.insert(
    "type".into(),
    vec![
      json!("Text"),
      json!("Text"),
      json!("Text"),
      json!("Text"),
      json!("ManualSortPos"),
    ],
  );

  let mut views = TableData::new(VIEWS_TABLE);
  views.row_ids = vec![1, 2];
  views
    .columns
    .insert("name".into(), vec![json!("ViewA"), json!("ViewB")]);

  let mut sections = TableData::new(SECTIONS_TABLE);
  sections.row_ids = vec![101, 102];
  sections
    .columns
    .insert("tableRef".into(), vec![json!(1), json!(2)]);
  sections
    .columns
    .insert("parentId".into(), vec![json!(1), json!(2)]);
  sections
    .columns
    .insert("title".into(), vec![json!("SecA"), json!("SecB")]);

  let mut fields = TableData::new(FIELDS_TABLE);
  fields.row_ids = vec![201, 202];
  fields
    .columns
    .insert("parentId".into(), vec![json!(101), json!(102)]);
  fields
    .columns
    .insert("colRef".into(), vec![json!(11), json!(21)]);
  fields
    .columns
    .insert("widgetOptions".into(), vec![json!("{}"), json!("{}")]);
  fields
    .columns
    .insert("filter".into(), vec![json!(""), json!("")]);

  return vec![tables, columns, views, sections, fields];
}

/// A `Teams` table for user-attribute lookups.
pub fn user_attr_tables() -> Vec<TableData> {
  let mut teams = TableData::new("Teams");
  teams.row_ids = vec![1];
  teams.columns.insert("email".into(), vec![json!("u@x.com")]);
  teams
    .columns
    .insert("manager".into(), vec![json!("m@x.com")]);
  return vec![teams];
}

/// In-memory stand-in for the backing database.
#[derive(Default)]
pub struct TestRowSource {
  doc: Mutex<DocData>,
}

impl TestRowSource {
  pub fn with_doc(doc: DocData) -> Self {
    return TestRowSource {
      doc: Mutex::new(doc),
    };
  }

  pub fn set_doc(&self, doc: DocData) {
    *self.doc.lock() = doc;
  }

  pub fn apply(&self, action: &crate::actions::DocAction) {
    self.doc.lock().receive_action(action);
  }
}

#[async_trait]
impl RowSource for TestRowSource {
  async fn fetch_query(&self, query: &TableQuery) -> Result<TableData, String> {
    let doc = self.doc.lock();
    let Some(table) = doc.get_table(&query.table_id) else {
      return Ok(TableData::new(query.table_id.clone()));
    };

    let mut result = TableData::new(query.table_id.clone());
    for col_id in table.columns.keys() {
      result.columns.insert(col_id.clone(), vec![]);
    }
    for (index, row_id) in table.row_ids.iter().enumerate() {
      let matches = query.filters.iter().all(|(col_id, values)| {
        let cell = if col_id == "id" {
          json!(row_id)
        } else {
          table.cell(col_id, index).cloned().unwrap_or(Value::Null)
        };
        return values.contains(&cell);
      });
      if !matches {
        continue;
      }
      result.row_ids.push(*row_id);
      for (col_id, cells) in &mut result.columns {
        cells.push(table.cell(col_id, index).cloned().unwrap_or(Value::Null));
      }
    }
    return Ok(result);
  }
}

/// Home-database fake for impersonation lookups.
#[derive(Default)]
pub struct TestHomeDb {
  pub users: Vec<UserProfile>,
}

#[async_trait]
impl HomeDb for TestHomeDb {
  async fn user_by_id(&self, user_id: i64) -> Option<UserProfile> {
    return self.users.iter().find(|u| u.user_id == user_id).cloned();
  }

  async fn user_by_email(&self, email: &str) -> Option<UserProfile> {
    return self.users.iter().find(|u| u.email == email).cloned();
  }
}

/// Captures every message the engine emits, per session.
#[derive(Default)]
pub struct TestBroadcaster {
  pub sessions: Mutex<Vec<Arc<DocSession>>>,
  pub sent: Mutex<Vec<(u64, DocUpdateMessage)>>,
}

impl TestBroadcaster {
  pub fn subscribe(&self, session: Arc<DocSession>) {
    self.sessions.lock().push(session);
  }

  pub fn messages_for(&self, session_id: u64) -> Vec<DocUpdateMessage> {
    return self
      .sent
      .lock()
      .iter()
      .filter(|(id, _)| *id == session_id)
      .map(|(_, message)| message.clone())
      .collect();
  }
}

#[async_trait]
impl Broadcaster for TestBroadcaster {
  fn subscribers(&self) -> Vec<Arc<DocSession>> {
    return self.sessions.lock().clone();
  }

  async fn send(&self, session: &DocSession, message: DocUpdateMessage) {
    self.sent.lock().push((session.session_id, message));
  }
}

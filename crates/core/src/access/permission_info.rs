use itertools::Itertools;
use log::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::permissions::{
  PartialPermissionSet, PermissionSet, PermissionSetWithContext, RuleType,
};
use crate::access::rules::{default_rule_set, special_default_rule_set};
use crate::access::rules::{EvalContext, RuleCollection, RuleCompiler, RuleSet};
use crate::access::user::UserInfo;
use crate::doc_data::TableReader;
use crate::records::RecordView;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
  Table(String),
  Column(String, String),
  Special(String),
  Full,
}

/// Lazily evaluates and memoizes permission verdicts for one user against
/// one rule collection. Requests without a concrete record resolve
/// rec-dependent rules to `Mixed`; [PermissionInfo::row_access] binds a row
/// and resolves them fully.
pub struct PermissionInfo {
  rules: Arc<RuleCollection>,
  user: Arc<UserInfo>,
  cache: Mutex<HashMap<CacheKey, PermissionSetWithContext>>,
}

impl PermissionInfo {
  pub fn new(rules: Arc<RuleCollection>, user: Arc<UserInfo>) -> Self {
    return PermissionInfo {
      rules,
      user,
      cache: Mutex::new(HashMap::new()),
    };
  }

  #[inline]
  pub fn user(&self) -> &Arc<UserInfo> {
    return &self.user;
  }

  #[inline]
  pub fn rules(&self) -> &Arc<RuleCollection> {
    return &self.rules;
  }

  /// Verdict for a whole table: the table-default set merged to agreement
  /// with every column-scoped set, so a bit reads `Mixed` when columns
  /// disagree.
  pub fn get_table_access(&self, table_id: &str) -> PermissionSetWithContext {
    let key = CacheKey::Table(table_id.to_string());
    if let Some(cached) = self.cache.lock().get(&key) {
      return cached.clone();
    }

    let (mut perms, mut memos) = self.eval_or_default(self.rules.table_default(table_id));
    for set in self.rules.column_rule_sets(table_id) {
      let (col_perms, col_memos) = self.eval_set(set);
      perms = perms.agreement(&PermissionSet::from(col_perms));
      memos.extend(col_memos);
    }

    let result = PermissionSetWithContext {
      perms,
      rule_type: RuleType::Table,
      memos,
    };
    self.cache.lock().insert(key, result.clone());
    return result;
  }

  /// Verdict for one column of a table.
  pub fn get_column_access(&self, table_id: &str, col_id: &str) -> PermissionSetWithContext {
    let key = CacheKey::Column(table_id.to_string(), col_id.to_string());
    if let Some(cached) = self.cache.lock().get(&key) {
      return cached.clone();
    }

    let set = self.rules.rule_set_for_column(table_id, col_id);
    let rule_type = set.map(|s| s.rule_type).unwrap_or(RuleType::Table);
    let (perms, memos) = self.eval_or_default(set);

    let result = PermissionSetWithContext {
      perms,
      rule_type,
      memos,
    };
    self.cache.lock().insert(key, result.clone());
    return result;
  }

  /// Document-wide summary: the fallback default merged to agreement with
  /// every ruled table.
  pub fn get_full_access(&self) -> PermissionSetWithContext {
    if let Some(cached) = self.cache.lock().get(&CacheKey::Full) {
      return cached.clone();
    }

    let (mut perms, mut memos) = self.eval_or_default(None);
    for table_id in self.rules.tables_with_rules().into_iter().sorted_unstable() {
      let access = self.get_table_access(table_id);
      perms = perms.agreement(&access.perms);
      memos.extend(access.memos);
    }

    let result = PermissionSetWithContext {
      perms,
      rule_type: RuleType::Table,
      memos,
    };
    self.cache.lock().insert(CacheKey::Full, result.clone());
    return result;
  }

  /// Verdict for a special (non-table) resource such as `AccessRules`.
  pub fn get_special_access(&self, name: &str) -> PermissionSetWithContext {
    let key = CacheKey::Special(name.to_string());
    if let Some(cached) = self.cache.lock().get(&key) {
      return cached.clone();
    }

    let (perms, memos) = match self.rules.special_rule_set(name) {
      Some(set) => self.eval_set(set),
      None => {
        let set = special_default_rule_set();
        self.eval_set(&set)
      }
    };
    let result = PermissionSetWithContext {
      perms: PermissionSet::from(perms),
      rule_type: RuleType::Special,
      memos,
    };
    self.cache.lock().insert(key, result.clone());
    return result;
  }

  /// Row-level verdict for a table, with `rec` (and optionally `newRec`)
  /// bound. Not memoized; callers iterate rows.
  pub fn row_access(
    &self,
    table_id: &str,
    rec: Option<RecordView<'_>>,
    new_rec: Option<RecordView<'_>>,
  ) -> PermissionSetWithContext {
    let (perms, memos) = match self.rules.table_default(table_id) {
      Some(set) => self.eval_set_with(set, rec, new_rec),
      None => {
        let set = default_rule_set(table_id);
        self.eval_set_with(&set, rec, new_rec)
      }
    };
    return PermissionSetWithContext {
      perms: PermissionSet::from(perms),
      rule_type: RuleType::Row,
      memos,
    };
  }

  /// Row-level verdict for one column, used for cell censoring.
  pub fn row_column_access(
    &self,
    table_id: &str,
    col_id: &str,
    rec: Option<RecordView<'_>>,
    new_rec: Option<RecordView<'_>>,
  ) -> PermissionSetWithContext {
    let (perms, memos) = match self.rules.rule_set_for_column(table_id, col_id) {
      Some(set) => self.eval_set_with(set, rec, new_rec),
      None => {
        let set = default_rule_set(table_id);
        self.eval_set_with(&set, rec, new_rec)
      }
    };
    return PermissionSetWithContext {
      perms: PermissionSet::from(perms),
      rule_type: RuleType::Row,
      memos,
    };
  }

  fn eval_or_default(&self, set: Option<&RuleSet>) -> (PermissionSet, Vec<String>) {
    let (perms, memos) = match set {
      Some(set) => self.eval_set(set),
      None => {
        let set = default_rule_set("*");
        self.eval_set(&set)
      }
    };
    return (PermissionSet::from(perms), memos);
  }

  fn eval_set(&self, set: &RuleSet) -> (PartialPermissionSet, Vec<String>) {
    return self.eval_set_with(set, None, None);
  }

  /// One ordered pass over a spliced rule set. First explicit verdict wins
  /// per bit; a rule that needs a record while none is bound marks its bits
  /// `Mixed`.
  fn eval_set_with(
    &self,
    set: &RuleSet,
    rec: Option<RecordView<'_>>,
    new_rec: Option<RecordView<'_>>,
  ) -> (PartialPermissionSet, Vec<String>) {
    let ctx = EvalContext {
      user: &self.user,
      rec,
      new_rec,
    };
    let mut perms = PartialPermissionSet::default();
    let mut memos: Vec<String> = vec![];

    for rule in &set.rules {
      if perms.is_complete() {
        break;
      }

      if rule.compiled.uses_rec && rec.is_none() && new_rec.is_none() {
        perms.merge_indeterminate(&rule.permissions);
        if rule.denies_anything() {
          if let Some(memo) = &rule.memo {
            memos.push(memo.clone());
          }
        }
        continue;
      }

      match (rule.compiled.predicate)(&ctx) {
        Ok(true) => {
          if rule.denies_anything() {
            if let Some(memo) = &rule.memo {
              memos.push(memo.clone());
            }
          }
          perms.merge_first_wins(&rule.permissions);
        }
        Ok(false) => {}
        Err(err) => {
          warn!(
            "rule {:?} on {:?} failed to evaluate: {err}",
            rule.formula, set.table_id
          );
          perms.merge_indeterminate(&rule.permissions);
        }
      }
    }

    return (perms, memos);
  }
}

/// Immutable snapshot of compiled rules plus a per-session cache of
/// [PermissionInfo]. Replaced wholesale on schema or ACL changes; readers
/// holding an `Arc<Ruler>` (e.g. in-flight broadcasts) keep their snapshot.
pub struct Ruler {
  rules: Arc<RuleCollection>,
  cache: Mutex<HashMap<u64, Arc<PermissionInfo>>>,
}

impl Ruler {
  pub fn new(doc: &dyn TableReader, compiler: &dyn RuleCompiler) -> Self {
    return Ruler {
      rules: Arc::new(RuleCollection::build(doc, compiler)),
      cache: Mutex::new(HashMap::new()),
    };
  }

  pub fn from_rules(rules: Arc<RuleCollection>) -> Self {
    return Ruler {
      rules,
      cache: Mutex::new(HashMap::new()),
    };
  }

  #[inline]
  pub fn rules(&self) -> &Arc<RuleCollection> {
    return &self.rules;
  }

  /// The memoized evaluator for one session, creating it on first use. The
  /// `user` must be the resolved user of that session; a stale entry for a
  /// different user identity is replaced.
  pub fn permission_info(&self, session_id: u64, user: &Arc<UserInfo>) -> Arc<PermissionInfo> {
    let mut cache = self.cache.lock();
    if let Some(info) = cache.get(&session_id) {
      if Arc::ptr_eq(info.user(), user) {
        return info.clone();
      }
    }
    let info = Arc::new(PermissionInfo::new(self.rules.clone(), user.clone()));
    cache.insert(session_id, info.clone());
    return info;
  }

  /// Drop all cached evaluators. Invoked on schema changes and on
  /// user-attribute source changes.
  pub fn clear_cache(&self) {
    self.cache.lock().clear();
  }

  pub fn forget_session(&self, session_id: u64) {
    self.cache.lock().remove(&session_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::access::permissions::Perm;
  use crate::access::test_utils::{acl_tables, user, TestCompiler};
  use crate::doc_data::DocData;
  use crate::session::Role;

  fn rules_for(spec: &[(&str, &str, &str, &str, &str)]) -> Arc<RuleCollection> {
    let doc = DocData::from_tables(acl_tables(spec));
    return Arc::new(RuleCollection::build(&doc, &TestCompiler));
  }

  #[test]
  fn test_table_access_defaults() {
    let rules = rules_for(&[]);
    let owner = PermissionInfo::new(rules.clone(), user("o@x.com", Some(Role::Owners)));
    let editor = PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));

    assert_eq!(owner.get_table_access("T").perms.read, Perm::Allow);
    assert_eq!(owner.get_table_access("T").perms.schema_edit, Perm::Allow);
    assert_eq!(editor.get_table_access("T").perms.read, Perm::Allow);
    assert_eq!(editor.get_table_access("T").perms.schema_edit, Perm::Deny);
  }

  #[test]
  fn test_column_rules_mix_table_access() {
    let rules = rules_for(&[(
      "T",
      "secret",
      "user.Access != 'owners'",
      "-R",
      "secret is confidential",
    )]);
    let editor = PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));

    // Table summary: columns disagree on read.
    assert_eq!(editor.get_table_access("T").perms.read, Perm::Mixed);
    let access = editor.get_column_access("T", "secret");
    assert_eq!(access.perms.read, Perm::Deny);
    assert_eq!(access.memos, vec!["secret is confidential".to_string()]);
    assert_eq!(editor.get_column_access("T", "public").perms.read, Perm::Allow);
  }

  #[test]
  fn test_row_rules_report_mixed_without_rec() {
    let rules = rules_for(&[("T", "*", "rec.status == 'open'", "+R", "")]);
    let editor = PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));
    assert_eq!(editor.get_table_access("T").perms.read, Perm::Mixed);
  }

  #[test]
  fn test_row_access_resolves_with_rec() {
    use crate::doc_data::TableData;
    use serde_json::json;

    let rules = rules_for(&[
      ("T", "*", "rec.status == 'open'", "+R", ""),
      ("T", "*", "", "-R", "closed records are hidden"),
    ]);
    let editor = PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));

    let mut t = TableData::new("T");
    t.row_ids = vec![1, 2];
    t.columns
      .insert("status".into(), vec![json!("open"), json!("draft")]);

    let open = RecordView::by_row_id(&t, 1).unwrap();
    let draft = RecordView::by_row_id(&t, 2).unwrap();
    assert_eq!(editor.row_access("T", Some(open), None).perms.read, Perm::Allow);
    let denied = editor.row_access("T", Some(draft), None);
    assert_eq!(denied.perms.read, Perm::Deny);
    assert_eq!(denied.memos, vec!["closed records are hidden".to_string()]);
  }

  #[test]
  fn test_special_access_defaults_to_owners() {
    let rules = rules_for(&[]);
    let owner = PermissionInfo::new(rules.clone(), user("o@x.com", Some(Role::Owners)));
    let editor = PermissionInfo::new(rules, user("e@x.com", Some(Role::Editors)));
    assert_eq!(
      owner.get_special_access("AccessRules").perms.read,
      Perm::Allow
    );
    assert_eq!(
      editor.get_special_access("AccessRules").perms.read,
      Perm::Deny
    );
  }

  #[test]
  fn test_ruler_cache_keyed_by_session() {
    let rules = rules_for(&[]);
    let ruler = Ruler::from_rules(rules);
    let u = user("e@x.com", Some(Role::Editors));
    let a = ruler.permission_info(1, &u);
    let b = ruler.permission_info(1, &u);
    assert!(Arc::ptr_eq(&a, &b));

    ruler.clear_cache();
    let c = ruler.permission_info(1, &u);
    assert!(!Arc::ptr_eq(&a, &c));
  }
}

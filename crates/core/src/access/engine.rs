use arc_swap::ArcSwap;
use log::*;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::censor::CensorshipInfo;
use crate::access::error::AccessError;
use crate::access::filters::{
  access_check_for_action, filter_action_columns, filter_step_for_viewer, AccessCheck, Severity,
};
use crate::access::permission_info::{PermissionInfo, Ruler};
use crate::access::permissions::{Perm, PermissionBit};
use crate::access::rules::RuleCompiler;
use crate::access::steps::{last_rows_for_table, ActionStep, MetaSnapshot, StepBuilder};
use crate::access::user::{HomeDb, ResolvedUser, UserOverride, UserResolver};
use crate::actions::{has_deliberate_rule_change, DocAction, UserAction, UserActionScope};
use crate::constants::{
  is_acl_table, is_structural_table, SPECIAL_ACCESS_RULES, SPECIAL_FULL_COPIES,
};
use crate::doc_data::{DocData, RowSource, TableData, TableQuery};
use crate::records::RecordView;
use crate::session::{ActionGroup, Broadcaster, DocSession, DocUpdateMessage, Role};

/// Engine options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessOptions {
  /// Suppress rule-compilation failures so a document with broken rules can
  /// be opened for repair.
  pub recovery_mode: bool,
  /// Value written over censored cells.
  pub censored_sentinel: String,
}

impl Default for AccessOptions {
  fn default() -> Self {
    return AccessOptions {
      recovery_mode: false,
      censored_sentinel: crate::constants::CENSORED_SENTINEL.to_string(),
    };
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BundlePhase {
  Open,
  Verified,
  Applied,
}

/// The active bundle: one atomic set of doc actions plus its undo stream,
/// moving through `begin -> canApply -> applied -> finished`.
struct Bundle {
  session: Arc<DocSession>,
  doc_actions: Vec<DocAction>,
  undo: Vec<DocAction>,
  phase: BundlePhase,
  /// Some user action explicitly targets an ACL table.
  deliberate_rule_change: bool,
  /// Some doc action touches an ACL table (possibly incidentally).
  rule_change: bool,
  schema_change: bool,
  user_attr_change: bool,
  steps: Option<Arc<Vec<ActionStep>>>,
}

/// The granular access control engine. Sits between the data engine and the
/// client broadcast layer: gates incoming mutations and rewrites each
/// committed change per viewer.
pub struct GranularAccess {
  doc: Arc<RwLock<DocData>>,
  row_source: Arc<dyn RowSource>,
  home_db: Arc<dyn HomeDb>,
  broadcaster: Arc<dyn Broadcaster>,
  compiler: Arc<dyn RuleCompiler>,
  options: AccessOptions,

  /// Current rule snapshot; swapped wholesale on schema/ACL changes.
  ruler: ArcSwap<Ruler>,
  /// Per-session resolved users; entries survive until the session is
  /// released or a user-attribute source table changes.
  user_attrs: Mutex<HashMap<u64, Arc<ResolvedUser>>>,
  /// Previous generation of `user_attrs`, present only between `applied`
  /// and `finished` when an attribute source was mutated.
  prev_user_attrs: Mutex<Option<HashMap<u64, Arc<ResolvedUser>>>>,

  bundle: tokio::sync::Mutex<Option<Bundle>>,
}

impl GranularAccess {
  pub fn new(
    doc: Arc<RwLock<DocData>>,
    row_source: Arc<dyn RowSource>,
    home_db: Arc<dyn HomeDb>,
    broadcaster: Arc<dyn Broadcaster>,
    compiler: Arc<dyn RuleCompiler>,
    options: AccessOptions,
  ) -> Self {
    let ruler = Ruler::new(&*doc.read(), &*compiler);
    return GranularAccess {
      doc,
      row_source,
      home_db,
      broadcaster,
      compiler,
      options,
      ruler: ArcSwap::from_pointee(ruler),
      user_attrs: Mutex::new(HashMap::new()),
      prev_user_attrs: Mutex::new(None),
      bundle: tokio::sync::Mutex::new(None),
    };
  }

  /// Rebuild rules from the current document and drop session caches.
  pub fn update(&self) {
    let ruler = Ruler::new(&*self.doc.read(), &*self.compiler);
    self.ruler.store(Arc::new(ruler));
  }

  /// Host hook: a session disconnected; drop everything keyed to it.
  pub fn release_session(&self, session: &DocSession) {
    self.user_attrs.lock().remove(&session.session_id);
    if let Some(ref mut prev) = *self.prev_user_attrs.lock() {
      prev.remove(&session.session_id);
    }
    self.ruler.load().forget_session(session.session_id);
  }

  // ---------------------------------------------------------------------
  // Bundle lifecycle
  // ---------------------------------------------------------------------

  /// Start a bundle. Rejects overlap: at most one bundle is active.
  pub async fn begin(
    &self,
    session: Arc<DocSession>,
    user_actions: &[UserAction],
    doc_actions: Vec<DocAction>,
    undo: Vec<DocAction>,
  ) -> Result<(), AccessError> {
    let mut guard = self.bundle.lock().await;
    if guard.is_some() {
      return Err(AccessError::Internal(
        "bundle already in progress".to_string(),
      ));
    }

    let attr_sources = self.ruler.load().rules().user_attr_source_tables();
    let rule_change = doc_actions.iter().any(|a| is_acl_table(a.table_id()));
    let schema_change = doc_actions
      .iter()
      .any(|a| a.is_schema_action() || is_structural_table(a.table_id()));
    let user_attr_change = doc_actions
      .iter()
      .any(|a| attr_sources.contains(a.table_id()));

    *guard = Some(Bundle {
      session,
      doc_actions,
      undo,
      phase: BundlePhase::Open,
      deliberate_rule_change: has_deliberate_rule_change(user_actions),
      rule_change,
      schema_change,
      user_attr_change,
      steps: None,
    });
    return Ok(());
  }

  /// Pre-commit verification: permission-check every doc action, and refuse
  /// rule changes that would leave the document un-loadable.
  pub async fn can_apply_bundle(&self) -> Result<(), AccessError> {
    let mut guard = self.bundle.lock().await;
    let bundle = guard
      .as_mut()
      .ok_or_else(|| AccessError::Internal("no active bundle".to_string()))?;
    if bundle.phase != BundlePhase::Open {
      return Err(AccessError::Internal(format!(
        "bundle in unexpected phase {:?}",
        bundle.phase
      )));
    }

    let session = bundle.session.clone();
    let resolved = self.resolved_user(&session).await?;

    if bundle.deliberate_rule_change && resolved.user.access != Some(Role::Owners) {
      return Err(AccessError::deny("only owners can modify access rules"));
    }

    let ruler = self.ruler.load_full();
    if ruler.rules().have_rules() {
      let perm_info = ruler.permission_info(session.session_id, &resolved.user);
      let steps = self.ensure_steps(bundle).await?;
      for (index, step) in steps.iter().enumerate() {
        self.check_incoming_doc_action(&steps, index, step, &perm_info)?;
      }
    }

    if bundle.rule_change {
      // Simulate the post-commit rule rebuild on a sandbox; a rule set that
      // fails to load must not be committed.
      let mut sandbox = MetaSnapshot::from_doc(&self.doc.read());
      for action in &bundle.doc_actions {
        sandbox = sandbox.apply(action);
      }
      let rules = crate::access::rules::RuleCollection::build(&sandbox, &*self.compiler);
      if let Some(err) = rules.rule_error() {
        return Err(AccessError::InvalidRules(err.to_string()));
      }
      rules
        .check_doc_entities(&sandbox)
        .map_err(AccessError::InvalidRules)?;
    }

    bundle.phase = BundlePhase::Verified;
    return Ok(());
  }

  /// The host committed the bundle.
  pub async fn applied_bundle(&self) {
    let mut guard = self.bundle.lock().await;
    let Some(bundle) = guard.as_mut() else {
      return;
    };
    bundle.phase = BundlePhase::Applied;

    if bundle.user_attr_change {
      // Attribute lookups are stale; keep the old generation around so the
      // outgoing filter can detect which viewers actually changed.
      let prev = std::mem::take(&mut *self.user_attrs.lock());
      *self.prev_user_attrs.lock() = Some(prev);
    }
    if bundle.user_attr_change || bundle.schema_change {
      self.ruler.load().clear_cache();
    }
  }

  /// Broadcast the committed bundle, rewriting it per subscriber.
  pub async fn send_doc_update_for_bundle(
    &self,
    action_group: &ActionGroup,
  ) -> Result<(), AccessError> {
    let mut guard = self.bundle.lock().await;
    let bundle = guard
      .as_mut()
      .ok_or_else(|| AccessError::Internal("no active bundle".to_string()))?;
    if bundle.phase != BundlePhase::Applied {
      return Err(AccessError::Internal(
        "bundle not applied yet".to_string(),
      ));
    }

    let subscribers = self.broadcaster.subscribers();

    if bundle.deliberate_rule_change {
      // Rules changed under every viewer's feet; nobody gets the action
      // stream, everybody reloads.
      for session in subscribers {
        self.broadcaster.send(&session, DocUpdateMessage::NeedReload).await;
      }
      return Ok(());
    }

    let steps = self.ensure_steps(bundle).await?;
    for session in subscribers {
      let message = match self.message_for_viewer(&session, &steps, action_group).await {
        Ok(message) => message,
        Err(AccessError::NeedReload) => DocUpdateMessage::NeedReload,
        Err(err) => {
          error!(
            "failed to filter update for session {}: {err}",
            session.session_id
          );
          DocUpdateMessage::NeedReload
        }
      };
      self.broadcaster.send(&session, message).await;
    }
    return Ok(());
  }

  /// Close the bundle and return to idle. Idempotent; called on both
  /// success and failure.
  pub async fn finished_bundle(&self) {
    let mut guard = self.bundle.lock().await;
    let Some(bundle) = guard.take() else {
      return;
    };
    if bundle.phase == BundlePhase::Applied && (bundle.rule_change || bundle.schema_change) {
      self.update();
    }
    *self.prev_user_attrs.lock() = None;
  }

  // ---------------------------------------------------------------------
  // Ingress checks
  // ---------------------------------------------------------------------

  /// Classify `actions` ahead of lowering. `Ok(true)` means definitely
  /// allowed, `Ok(false)` means undecidable before lowering; hard denials
  /// throw.
  pub async fn assert_can_maybe_apply_user_actions(
    &self,
    session: &DocSession,
    actions: &[UserAction],
  ) -> Result<bool, AccessError> {
    let mut decided = true;
    for action in actions {
      if action.is_container() {
        let nested = action.nested();
        if !Box::pin(self.assert_can_maybe_apply_user_actions(session, &nested)).await? {
          decided = false;
        }
        continue;
      }

      match action.scope() {
        UserActionScope::Ok => {}
        UserActionScope::Special => {
          if self.has_nuanced_access(session).await? {
            return Err(AccessError::deny(format!(
              "blocked by access rules: {}",
              action.name
            )));
          }
        }
        UserActionScope::Surprising => {
          if !self.has_full_access(session).await? {
            return Err(AccessError::deny(format!(
              "only full access users may use {}",
              action.name
            )));
          }
        }
        UserActionScope::Data => {
          if !self.check_data_user_action(session, action).await? {
            decided = false;
          }
        }
        UserActionScope::Deferred => {
          decided = false;
        }
      }
    }
    return Ok(decided);
  }

  async fn check_data_user_action(
    &self,
    session: &DocSession,
    action: &UserAction,
  ) -> Result<bool, AccessError> {
    let Some(table_id) = action.table_id() else {
      return Ok(false);
    };
    let bit = match action.name.as_str() {
      "AddRecord" | "BulkAddRecord" | "ReplaceTableData" | "TableData" => PermissionBit::Create,
      "UpdateRecord" | "BulkUpdateRecord" => PermissionBit::Update,
      _ => PermissionBit::Delete,
    };
    let perm_info = self.permission_info_for(session).await?;
    let access = perm_info.get_table_access(table_id);
    let check = AccessCheck::new(bit, Severity::Fatal);
    let verdict = check.check(&access)?;
    return Ok(verdict == Perm::Allow);
  }

  /// Permission-check one lowered doc action against the current rules.
  fn check_incoming_doc_action(
    &self,
    steps: &[ActionStep],
    index: usize,
    step: &ActionStep,
    perm_info: &PermissionInfo,
  ) -> Result<(), AccessError> {
    let action = &step.action;
    let table_id = action.table_id().to_string();
    let check = access_check_for_action(action, Severity::Fatal);

    let table_access = perm_info.get_table_access(&table_id);
    let verdict = check.check(&table_access)?;
    if verdict == Perm::Allow {
      return Ok(());
    }

    // Mixed: column rules or row rules need a closer look. The same pruner
    // that shapes egress runs here with fatal severity.
    filter_action_columns(action.clone(), perm_info, &check)?;

    if perm_info.rules().has_row_rules(&table_id) && action.is_data_action() {
      let rows_before = step.rows_before.as_deref();
      let new_rows = last_rows_for_table(steps, index, &table_id);
      for row_id in action.row_ids() {
        let rec = rows_before.and_then(|rows| RecordView::by_row_id(rows, row_id));
        let new_rec = match action.is_remove_like() {
          true => None,
          false => new_rows.and_then(|rows| RecordView::by_row_id(rows, row_id)),
        };
        if rec.is_none() && new_rec.is_none() {
          continue;
        }
        let access = perm_info.row_access(&table_id, rec, new_rec);
        check.throw_if_denied(&access)?;
      }
    }
    return Ok(());
  }

  // ---------------------------------------------------------------------
  // Outgoing filters
  // ---------------------------------------------------------------------

  async fn message_for_viewer(
    &self,
    session: &DocSession,
    steps: &[ActionStep],
    action_group: &ActionGroup,
  ) -> Result<DocUpdateMessage, AccessError> {
    self.check_user_attributes(session).await?;

    let resolved = self.resolved_user(session).await?;
    let mut doc_actions: Vec<DocAction> = vec![];
    for step in steps {
      let perm_info = step.ruler.permission_info(session.session_id, &resolved.user);
      let can_view_rules = perm_info
        .get_special_access(SPECIAL_ACCESS_RULES)
        .perms
        .read
        == Perm::Allow;
      doc_actions.extend(filter_step_for_viewer(
        step,
        &perm_info,
        can_view_rules,
        &self.options.censored_sentinel,
      )?);
    }

    return Ok(DocUpdateMessage::DocUserAction {
      action_group: self.filter_action_group(session, action_group).await?,
      doc_actions,
    });
  }

  /// Guard before every outgoing filter: if this viewer's user-attribute
  /// inputs changed with the applied bundle, they must reload.
  async fn check_user_attributes(&self, session: &DocSession) -> Result<(), AccessError> {
    let prev = {
      let guard = self.prev_user_attrs.lock();
      let Some(ref prev_map) = *guard else {
        return Ok(());
      };
      let Some(prev) = prev_map.get(&session.session_id) else {
        return Ok(());
      };
      prev.clone()
    };

    let fresh = self.resolved_user(session).await?;
    if fresh.attrs_fingerprint() != prev.attrs_fingerprint() {
      return Err(AccessError::NeedReload);
    }
    return Ok(());
  }

  /// Gate for broadcasts outside the bundled send path. When `actions` is
  /// the active bundle's stream the bundle's steps are reused; otherwise
  /// steps are derived from `actions` against current state.
  pub async fn filter_outgoing_doc_actions(
    &self,
    session: &DocSession,
    actions: &[DocAction],
  ) -> Result<Vec<DocAction>, AccessError> {
    let steps = {
      let mut guard = self.bundle.lock().await;
      match guard.as_mut() {
        Some(bundle) if bundle.doc_actions == actions => Some(self.ensure_steps(bundle).await?),
        _ => None,
      }
    };
    let steps = match steps {
      Some(steps) => steps,
      None => {
        let builder = StepBuilder {
          row_source: &*self.row_source,
          compiler: &*self.compiler,
        };
        let seed = MetaSnapshot::from_doc(&self.doc.read());
        Arc::new(
          builder
            .build(actions, &[], true, seed, self.ruler.load_full())
            .await?,
        )
      }
    };

    let resolved = self.resolved_user(session).await?;
    let mut out: Vec<DocAction> = vec![];
    for step in steps.iter() {
      let perm_info = step.ruler.permission_info(session.session_id, &resolved.user);
      let can_view_rules = perm_info
        .get_special_access(SPECIAL_ACCESS_RULES)
        .perms
        .read
        == Perm::Allow;
      out.extend(filter_step_for_viewer(
        step,
        &perm_info,
        can_view_rules,
        &self.options.censored_sentinel,
      )?);
    }
    return Ok(out);
  }

  /// Suppress the action summary and description unless the viewer can read
  /// everything.
  pub async fn filter_action_group(
    &self,
    session: &DocSession,
    action_group: &ActionGroup,
  ) -> Result<ActionGroup, AccessError> {
    if self.can_read_everything(session).await? {
      return Ok(action_group.clone());
    }
    return Ok(ActionGroup {
      action_num: action_group.action_num,
      desc: None,
      action_summary: None,
    });
  }

  /// In-place row and column censoring of one fetched table.
  pub async fn filter_data(
    &self,
    session: &DocSession,
    data: &mut TableData,
  ) -> Result<(), AccessError> {
    let resolved = self.resolved_user(session).await?;
    let ruler = self.ruler.load_full();
    let perm_info = ruler.permission_info(session.session_id, &resolved.user);
    let can_view_rules = perm_info
      .get_special_access(SPECIAL_ACCESS_RULES)
      .perms
      .read
      == Perm::Allow;

    // Run the fetched table through the same pipeline as a broadcast
    // TableData action, with identical before/after state.
    let action: DocAction = data.clone().into();
    let step = ActionStep {
      action,
      rows_before: Some(Arc::new(data.clone())),
      rows_after: Some(Arc::new(data.clone())),
      meta_before: None,
      meta_after: Some(MetaSnapshot::from_doc(&self.doc.read())),
      ruler: ruler.clone(),
    };
    let out =
      filter_step_for_viewer(&step, &perm_info, can_view_rules, &self.options.censored_sentinel)?;

    match out.into_iter().next() {
      Some(DocAction::TableData {
        row_ids, columns, ..
      }) => {
        data.row_ids = row_ids;
        data.columns = columns;
      }
      _ => {
        data.row_ids.clear();
        for cells in data.columns.values_mut() {
          cells.clear();
        }
      }
    }
    return Ok(());
  }

  /// Censored structural-table bundle for doc-open.
  pub async fn filter_meta_tables(
    &self,
    session: &DocSession,
    tables: &mut HashMap<String, TableData>,
  ) -> Result<(), AccessError> {
    let perm_info = self.permission_info_for(session).await?;
    let can_view_rules = perm_info
      .get_special_access(SPECIAL_ACCESS_RULES)
      .perms
      .read
      == Perm::Allow;

    let meta = MetaSnapshot::from_tables(tables.values().cloned());
    let censorship = CensorshipInfo::new(&meta, &perm_info);
    for (_table_id, data) in tables.iter_mut() {
      let action: DocAction = data.clone().into();
      match censorship.censor_action(action, can_view_rules) {
        Some(DocAction::TableData {
          row_ids, columns, ..
        }) => {
          data.row_ids = row_ids;
          data.columns = columns;
        }
        _ => {
          data.row_ids.clear();
          for cells in data.columns.values_mut() {
            cells.clear();
          }
        }
      }
    }
    return Ok(());
  }

  // ---------------------------------------------------------------------
  // Access queries
  // ---------------------------------------------------------------------

  pub async fn has_table_access(
    &self,
    session: &DocSession,
    table_id: &str,
  ) -> Result<bool, AccessError> {
    let perm_info = self.permission_info_for(session).await?;
    return Ok(perm_info.get_table_access(table_id).perms.read != Perm::Deny);
  }

  pub async fn has_query_access(
    &self,
    session: &DocSession,
    query: &TableQuery,
  ) -> Result<bool, AccessError> {
    return self.has_table_access(session, &query.table_id).await;
  }

  /// True iff rules exist and the user is not a full-access user.
  pub async fn has_nuanced_access(&self, session: &DocSession) -> Result<bool, AccessError> {
    if !self.ruler.load().rules().have_rules() {
      return Ok(false);
    }
    return Ok(!self.has_full_access(session).await?);
  }

  pub async fn has_full_access(&self, session: &DocSession) -> Result<bool, AccessError> {
    let resolved = self.resolved_user(session).await?;
    return Ok(resolved.user.access == Some(Role::Owners));
  }

  pub async fn can_read_everything(&self, session: &DocSession) -> Result<bool, AccessError> {
    let perm_info = self.permission_info_for(session).await?;
    return Ok(perm_info.get_full_access().perms.read == Perm::Allow);
  }

  pub async fn can_copy_everything(&self, session: &DocSession) -> Result<bool, AccessError> {
    return Ok(
      self.has_full_copies_permission(session).await? || self.can_read_everything(session).await?,
    );
  }

  /// Owners and readers-of-everything may probe values (autocomplete,
  /// find). Composite check kept for compatibility; there is no dedicated
  /// permission bit.
  pub async fn can_scan_data(&self, session: &DocSession) -> Result<bool, AccessError> {
    return Ok(self.has_full_access(session).await? || self.can_read_everything(session).await?);
  }

  pub async fn has_full_copies_permission(
    &self,
    session: &DocSession,
  ) -> Result<bool, AccessError> {
    let perm_info = self.permission_info_for(session).await?;
    return Ok(perm_info.get_special_access(SPECIAL_FULL_COPIES).perms.read == Perm::Allow);
  }

  pub async fn has_access_rules_permission(
    &self,
    session: &DocSession,
  ) -> Result<bool, AccessError> {
    let perm_info = self.permission_info_for(session).await?;
    return Ok(
      perm_info.get_special_access(SPECIAL_ACCESS_RULES).perms.read == Perm::Allow,
    );
  }

  /// The impersonation override attached to this session, if any.
  pub async fn get_user_override(
    &self,
    session: &DocSession,
  ) -> Result<Option<UserOverride>, AccessError> {
    let resolved = self.resolved_user(session).await?;
    return Ok(resolved.override_user.clone());
  }

  // ---------------------------------------------------------------------
  // Internals
  // ---------------------------------------------------------------------

  async fn resolved_user(&self, session: &DocSession) -> Result<Arc<ResolvedUser>, AccessError> {
    if let Some(cached) = self.user_attrs.lock().get(&session.session_id) {
      return Ok(cached.clone());
    }

    let rules = self.ruler.load().rules().clone();
    let resolver = UserResolver {
      home_db: &*self.home_db,
      row_source: &*self.row_source,
      recovery_mode: self.options.recovery_mode,
    };
    let resolved = Arc::new(resolver.resolve(session, &rules).await?);
    self
      .user_attrs
      .lock()
      .insert(session.session_id, resolved.clone());
    return Ok(resolved);
  }

  async fn permission_info_for(
    &self,
    session: &DocSession,
  ) -> Result<Arc<PermissionInfo>, AccessError> {
    let resolved = self.resolved_user(session).await?;
    let ruler = self.ruler.load_full();
    return Ok(ruler.permission_info(session.session_id, &resolved.user));
  }

  /// Steps are computed once per bundle and reused across verification and
  /// every per-viewer filter.
  async fn ensure_steps(&self, bundle: &mut Bundle) -> Result<Arc<Vec<ActionStep>>, AccessError> {
    if let Some(ref steps) = bundle.steps {
      return Ok(steps.clone());
    }
    let builder = StepBuilder {
      row_source: &*self.row_source,
      compiler: &*self.compiler,
    };
    let seed = MetaSnapshot::from_doc(&self.doc.read());
    let steps = builder
      .build(
        &bundle.doc_actions,
        &bundle.undo,
        bundle.phase == BundlePhase::Applied,
        seed,
        self.ruler.load_full(),
      )
      .await?;
    let steps = Arc::new(steps);
    bundle.steps = Some(steps.clone());
    return Ok(steps);
  }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::actions::DocAction;

/// Document-level role as granted by the host's authorizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
  Owners,
  Editors,
  Viewers,
}

impl Role {
  pub fn as_str(&self) -> &'static str {
    return match self {
      Role::Owners => "owners",
      Role::Editors => "editors",
      Role::Viewers => "viewers",
    };
  }
}

/// One subscribed client session. The `session_id` is the identity key for
/// all per-session caches; the host must call
/// `GranularAccess::release_session` when it drops a session.
#[derive(Debug, Clone)]
pub struct DocSession {
  pub session_id: u64,
  pub user_id: i64,
  pub email: String,
  pub name: String,
  /// Role granted by the authorizer; `None` means no access.
  pub access: Option<Role>,
  pub origin: Option<String>,
  /// Share/link parameters attached to the session, e.g. impersonation.
  pub link_parameters: HashMap<String, String>,
}

/// Summary of one committed bundle, shipped alongside the filtered actions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionGroup {
  pub action_num: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub desc: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub action_summary: Option<Value>,
}

/// One outgoing message for one subscriber.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DocUpdateMessage {
  /// The per-viewer filtered view of a committed bundle.
  DocUserAction {
    action_group: ActionGroup,
    doc_actions: Vec<DocAction>,
  },
  /// The viewer's rule inputs changed; they must reload the document.
  NeedReload,
}

/// Client broadcast layer, injected by the host. The engine computes one
/// message per subscriber and hands each off for delivery.
#[async_trait]
pub trait Broadcaster: Send + Sync {
  fn subscribers(&self) -> Vec<Arc<DocSession>>;

  async fn send(&self, session: &DocSession, message: DocUpdateMessage);
}

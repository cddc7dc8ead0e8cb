use thiserror::Error;

/// Wire-visible errors of the access engine.
///
/// Deliberately kept close to the wire codes so hosts can map them without
/// inspecting internals. NOTE: no `#[from]` conversions for wire-visible
/// variants; mappings stay explicit at the call site.
#[derive(Debug, Error)]
pub enum AccessError {
  /// Hard denial from an ingress check. Carries memos from denying rules so
  /// the client can surface the rule author's explanation.
  #[error("Blocked by access rules: {message}")]
  AclDeny { message: String, memos: Vec<String> },

  /// The viewer's rule inputs changed; their client must reload.
  #[error("Document needs reload")]
  NeedReload,

  /// Owner-only operation attempted without owner access. Upstream UIs treat
  /// this as "not available" rather than as an error.
  #[error("No owner access")]
  AuthNoOwner,

  /// A proposed rule change would leave the document un-loadable.
  #[error("Invalid access rules: {0}")]
  InvalidRules(String),

  /// Internal invariant violation; aborts the current filter.
  #[error("Internal: {0}")]
  Internal(String),
}

impl AccessError {
  pub fn deny(message: impl Into<String>) -> Self {
    return AccessError::AclDeny {
      message: message.into(),
      memos: vec![],
    };
  }

  pub fn deny_with_memos(message: impl Into<String>, memos: Vec<String>) -> Self {
    return AccessError::AclDeny {
      message: message.into(),
      memos,
    };
  }

  /// Wire error code.
  pub fn code(&self) -> &'static str {
    return match self {
      AccessError::AclDeny { .. } => "ACL_DENY",
      AccessError::NeedReload => "NEED_RELOAD",
      AccessError::AuthNoOwner => "AUTH_NO_OWNER",
      AccessError::InvalidRules(_) => "ACL_RULES_INVALID",
      AccessError::Internal(_) => "INTERNAL",
    };
  }

  /// HTTP status the host should surface.
  pub fn status(&self) -> u16 {
    return match self {
      AccessError::AclDeny { .. } => 403,
      AccessError::NeedReload => 409,
      AccessError::AuthNoOwner => 403,
      AccessError::InvalidRules(_) => 400,
      AccessError::Internal(_) => 500,
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_codes_and_status() {
    let err = AccessError::deny_with_memos("no", vec!["ask an admin".to_string()]);
    assert_eq!(err.code(), "ACL_DENY");
    assert_eq!(err.status(), 403);

    assert_eq!(AccessError::InvalidRules("x".into()).status(), 400);
    assert_eq!(AccessError::NeedReload.code(), "NEED_RELOAD");
  }
}

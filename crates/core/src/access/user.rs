use async_trait::async_trait;
use log::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::access::error::AccessError;
use crate::access::rules::RuleCollection;
use crate::actions::{CellValue, RowValues};
use crate::constants::{BUILTIN_USER_FIELDS, LINK_AS_USER, LINK_AS_USER_ID};
use crate::doc_data::{RowSource, TableQuery};
use crate::session::{DocSession, Role};

/// A user as looked up in the home database, used to resolve impersonation
/// targets.
#[derive(Debug, Clone, PartialEq)]
pub struct UserProfile {
  pub user_id: i64,
  pub email: String,
  pub name: String,
  /// The target's access to this document; `None` means no access.
  pub access: Option<Role>,
}

/// Home database lookups, injected by the host.
#[async_trait]
pub trait HomeDb: Send + Sync {
  async fn user_by_id(&self, user_id: i64) -> Option<UserProfile>;
  async fn user_by_email(&self, email: &str) -> Option<UserProfile>;
}

/// Identity override produced by owner impersonation.
#[derive(Debug, Clone, PartialEq)]
pub struct UserOverride {
  pub user_id: i64,
  pub email: String,
  pub name: String,
  pub access: Option<Role>,
}

/// One attached user attribute: the matched record of the source table, or
/// an empty view when the lookup matched nothing.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeRecord {
  pub table_id: String,
  pub row: RowValues,
}

/// The rule-visible identity of a session: base fields plus the dynamic
/// attributes attached by user-attribute rules.
#[derive(Debug, Clone)]
pub struct UserInfo {
  pub access: Option<Role>,
  pub user_id: i64,
  pub email: String,
  pub name: String,
  pub origin: Option<String>,
  pub link_key: HashMap<String, String>,
  pub attributes: HashMap<String, AttributeRecord>,
}

impl UserInfo {
  pub fn from_session(session: &DocSession) -> Self {
    return UserInfo {
      access: session.access,
      user_id: session.user_id,
      email: session.email.clone(),
      name: session.name.clone(),
      origin: session.origin.clone(),
      link_key: session.link_parameters.clone(),
      attributes: HashMap::new(),
    };
  }

  /// Dotted-path field lookup, e.g. `"Email"`, `"LinkKey.code"`,
  /// `"Team.manager"`. The first segment is a built-in field or an attached
  /// attribute name; further segments descend into the attribute record.
  pub fn get_path(&self, path: &str) -> Option<CellValue> {
    let mut segments = path.split('.');
    let head = segments.next()?;

    let mut current: CellValue = match head {
      "Access" => self
        .access
        .map(|a| Value::from(a.as_str()))
        .unwrap_or(Value::Null),
      "UserID" => Value::from(self.user_id),
      "Email" => Value::from(self.email.clone()),
      "Name" => Value::from(self.name.clone()),
      "Origin" => self
        .origin
        .clone()
        .map(Value::from)
        .unwrap_or(Value::Null),
      "LinkKey" => Value::Object(
        self
          .link_key
          .iter()
          .map(|(k, v)| (k.clone(), Value::from(v.clone())))
          .collect(),
      ),
      name => {
        let attr = self.attributes.get(name)?;
        Value::Object(attr.row.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      }
    };

    for segment in segments {
      let Value::Object(map) = current else {
        return None;
      };
      current = map.get(segment)?.clone();
    }
    return Some(current);
  }
}

/// The cached result of resolving one session. Entries live in the engine's
/// session-keyed map until the session is released or a user-attribute
/// source table changes.
#[derive(Clone)]
pub struct ResolvedUser {
  pub user: Arc<UserInfo>,
  pub override_user: Option<UserOverride>,
  pub attr_rows: HashMap<String, AttributeRecord>,
}

impl ResolvedUser {
  /// Stable serialization of the attached attributes, used to detect when a
  /// viewer's rule inputs changed under them.
  pub fn attrs_fingerprint(&self) -> String {
    let mut names: Vec<&String> = self.attr_rows.keys().collect();
    names.sort();
    let parts: Vec<Value> = names
      .into_iter()
      .map(|name| {
        let attr = &self.attr_rows[name];
        let row: serde_json::Map<String, Value> =
          attr.row.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        return serde_json::json!([name, attr.table_id, row]);
      })
      .collect();
    return serde_json::to_string(&parts).unwrap_or_default();
  }
}

/// Produces [UserInfo] for a session: base identity, optional owner-only
/// impersonation via link parameters, and rule-driven attribute lookups.
pub struct UserResolver<'a> {
  pub home_db: &'a dyn HomeDb,
  pub row_source: &'a dyn RowSource,
  pub recovery_mode: bool,
}

impl UserResolver<'_> {
  pub async fn resolve(
    &self,
    session: &DocSession,
    rules: &RuleCollection,
  ) -> Result<ResolvedUser, AccessError> {
    if let Some(err) = rules.rule_error() {
      if self.recovery_mode {
        warn!("ignoring rule error in recovery mode: {err}");
      } else {
        return Err(AccessError::InvalidRules(err.to_string()));
      }
    }

    let mut user = UserInfo::from_session(session);

    let override_user = self.resolve_override(session).await?;
    if let Some(ref o) = override_user {
      user.access = o.access;
      user.user_id = o.user_id;
      user.email = o.email.clone();
      user.name = o.name.clone();
    }

    let mut attr_rows = HashMap::new();
    for rule in rules.user_attribute_rules() {
      if BUILTIN_USER_FIELDS.contains(&rule.name.as_str()) {
        warn!(
          "user attribute {:?} collides with a built-in field; ignored",
          rule.name
        );
        continue;
      }
      if user.attributes.contains_key(&rule.name) {
        warn!("duplicate user attribute {:?}; first wins", rule.name);
        continue;
      }

      let lookup_value = user.get_path(&rule.char_id).unwrap_or(Value::Null);
      let record = match self.lookup_attribute(rule, lookup_value).await {
        Ok(record) => record,
        Err(err) => {
          warn!(
            "user attribute {:?} lookup against {:?} failed: {err}",
            rule.name, rule.table_id
          );
          AttributeRecord {
            table_id: rule.table_id.clone(),
            row: RowValues::new(),
          }
        }
      };
      attr_rows.insert(rule.name.clone(), record.clone());
      user.attributes.insert(rule.name.clone(), record);
    }

    return Ok(ResolvedUser {
      user: Arc::new(user),
      override_user,
      attr_rows,
    });
  }

  async fn resolve_override(
    &self,
    session: &DocSession,
  ) -> Result<Option<UserOverride>, AccessError> {
    let as_user_id = session.link_parameters.get(LINK_AS_USER_ID);
    let as_user = session.link_parameters.get(LINK_AS_USER);
    if as_user_id.is_none() && as_user.is_none() {
      return Ok(None);
    }

    if session.access != Some(Role::Owners) {
      return Err(AccessError::deny("only owners can impersonate other users"));
    }

    let profile = if let Some(id) = as_user_id {
      let Ok(id) = id.parse::<i64>() else {
        return Err(AccessError::deny(format!("invalid {LINK_AS_USER_ID}: {id:?}")));
      };
      self.home_db.user_by_id(id).await
    } else {
      self.home_db.user_by_email(as_user.unwrap()).await
    };

    // A missing target yields an identity with no access at all, not an
    // error: the owner sees the document as a stranger would.
    return Ok(Some(match profile {
      Some(p) => UserOverride {
        user_id: p.user_id,
        email: p.email,
        name: p.name,
        access: p.access,
      },
      None => UserOverride {
        user_id: 0,
        email: as_user.cloned().unwrap_or_default(),
        name: String::new(),
        access: None,
      },
    }));
  }

  async fn lookup_attribute(
    &self,
    rule: &crate::access::rules::UserAttributeRule,
    lookup_value: CellValue,
  ) -> Result<AttributeRecord, String> {
    let mut filters = HashMap::new();
    filters.insert(rule.lookup_col_id.clone(), vec![lookup_value]);
    let query = TableQuery {
      table_id: rule.table_id.clone(),
      filters,
    };

    let data = self.row_source.fetch_query(&query).await?;
    let row = if data.is_empty() {
      RowValues::new()
    } else {
      let mut row = RowValues::new();
      row.insert("id".to_string(), Value::from(data.row_ids[0]));
      for (col_id, cells) in &data.columns {
        row.insert(col_id.clone(), cells.first().cloned().unwrap_or(Value::Null));
      }
      row
    };
    return Ok(AttributeRecord {
      table_id: rule.table_id.clone(),
      row,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::access::test_utils::{
    acl_tables, session_with_links, user_attr_tables, TestCompiler, TestHomeDb, TestRowSource,
  };
  use crate::doc_data::DocData;
  use serde_json::json;

  fn resolver<'a>(home: &'a TestHomeDb, rows: &'a TestRowSource) -> UserResolver<'a> {
    return UserResolver {
      home_db: home,
      row_source: rows,
      recovery_mode: false,
    };
  }

  #[test]
  fn test_get_path() {
    let session = session_with_links(1, "u@x.com", Some(Role::Editors), &[("code", "k1")]);
    let mut user = UserInfo::from_session(&session);
    user.attributes.insert(
      "Team".to_string(),
      AttributeRecord {
        table_id: "Teams".to_string(),
        row: [("manager".to_string(), json!("m@x.com"))].into_iter().collect(),
      },
    );

    assert_eq!(user.get_path("Email"), Some(json!("u@x.com")));
    assert_eq!(user.get_path("Access"), Some(json!("editors")));
    assert_eq!(user.get_path("LinkKey.code"), Some(json!("k1")));
    assert_eq!(user.get_path("Team.manager"), Some(json!("m@x.com")));
    assert_eq!(user.get_path("Team.missing"), None);
    assert_eq!(user.get_path("Nope"), None);
  }

  #[tokio::test]
  async fn test_impersonation_requires_owner() {
    let home = TestHomeDb::default();
    let rows = TestRowSource::default();
    let rules = RuleCollection::empty();

    let session = session_with_links(1, "e@x.com", Some(Role::Editors), &[("aclAsUserId", "42")]);
    let err = resolver(&home, &rows)
      .resolve(&session, &rules)
      .await
      .err()
      .unwrap();
    assert_eq!(err.code(), "ACL_DENY");
  }

  #[tokio::test]
  async fn test_impersonation_resolves_target() {
    let mut home = TestHomeDb::default();
    home.users.push(UserProfile {
      user_id: 42,
      email: "v@x.com".to_string(),
      name: "V".to_string(),
      access: Some(Role::Viewers),
    });
    let rows = TestRowSource::default();
    let rules = RuleCollection::empty();

    let session = session_with_links(1, "o@x.com", Some(Role::Owners), &[("aclAsUserId", "42")]);
    let resolved = resolver(&home, &rows).resolve(&session, &rules).await.unwrap();
    assert_eq!(resolved.user.access, Some(Role::Viewers));
    assert_eq!(resolved.user.email, "v@x.com");
    assert!(resolved.override_user.is_some());

    // Unknown target: access denied rather than an error.
    let session = session_with_links(1, "o@x.com", Some(Role::Owners), &[("aclAsUserId", "43")]);
    let resolved = resolver(&home, &rows).resolve(&session, &rules).await.unwrap();
    assert_eq!(resolved.user.access, None);
  }

  #[tokio::test]
  async fn test_user_attribute_lookup() {
    let home = TestHomeDb::default();
    let rows = TestRowSource::with_doc(DocData::from_tables(user_attr_tables()));
    let doc = DocData::from_tables(acl_tables(&[]));
    let mut rules_doc = doc.clone();
    for t in crate::access::test_utils::attr_rule_tables("Team", "Teams", "email", "Email") {
      rules_doc.load_table(t);
    }
    let rules = RuleCollection::build(&rules_doc, &TestCompiler);
    assert_eq!(rules.user_attribute_rules().len(), 1);

    let session = session_with_links(1, "u@x.com", Some(Role::Editors), &[]);
    let resolved = resolver(&home, &rows).resolve(&session, &rules).await.unwrap();
    let team = &resolved.user.attributes["Team"];
    assert_eq!(team.row["manager"], json!("m@x.com"));

    // Missing match attaches an empty view.
    let session = session_with_links(2, "nobody@x.com", Some(Role::Editors), &[]);
    let resolved = resolver(&home, &rows).resolve(&session, &rules).await.unwrap();
    assert!(resolved.user.attributes["Team"].row.is_empty());
  }

  #[tokio::test]
  async fn test_rule_error_blocks_resolution() {
    let home = TestHomeDb::default();
    let rows = TestRowSource::default();
    let doc = DocData::from_tables(acl_tables(&[("T", "*", "broken ((", "+R", "")]));
    let rules = RuleCollection::build(&doc, &TestCompiler);

    let session = session_with_links(1, "u@x.com", Some(Role::Owners), &[]);
    let err = resolver(&home, &rows)
      .resolve(&session, &rules)
      .await
      .err()
      .unwrap();
    assert_eq!(err.status(), 400);

    // Recovery mode suppresses the failure.
    let recovering = UserResolver {
      home_db: &home,
      row_source: &rows,
      recovery_mode: true,
    };
    assert!(recovering.resolve(&session, &rules).await.is_ok());
  }
}

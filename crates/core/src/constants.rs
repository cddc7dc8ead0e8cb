/// Structural metadata tables. These are fixed, privileged table ids: schema
/// changes and access-rule resolution both key off them.
pub const TABLES_TABLE: &str = "_grist_Tables";
pub const COLUMNS_TABLE: &str = "_grist_Tables_column";
pub const VIEWS_TABLE: &str = "_grist_Views";
pub const SECTIONS_TABLE: &str = "_grist_Views_section";
pub const FIELDS_TABLE: &str = "_grist_Views_section_field";
pub const ACL_RESOURCES_TABLE: &str = "_grist_ACLResources";
pub const ACL_RULES_TABLE: &str = "_grist_ACLRules";

pub const STRUCTURAL_TABLES: [&str; 7] = [
  TABLES_TABLE,
  COLUMNS_TABLE,
  VIEWS_TABLE,
  SECTIONS_TABLE,
  FIELDS_TABLE,
  ACL_RESOURCES_TABLE,
  ACL_RULES_TABLE,
];

/// The five structural tables that are censored row-by-row. The two ACL
/// tables are handled separately (all-or-nothing).
pub const CENSORABLE_TABLES: [&str; 5] = [
  TABLES_TABLE,
  COLUMNS_TABLE,
  VIEWS_TABLE,
  SECTIONS_TABLE,
  FIELDS_TABLE,
];

/// Sort-order column, preserved unconditionally by column pruning.
pub const MANUAL_SORT: &str = "manualSort";

/// Default sentinel written over cells the viewer may not read. Hosts can
/// override it through `AccessOptions`.
pub const CENSORED_SENTINEL: &str = "CENSORED";

/// Resource table id marking special (non-table) rule resources.
pub const SPECIAL_RESOURCE: &str = "*SPECIAL";

/// Special rule resources selectable under [SPECIAL_RESOURCE].
pub const SPECIAL_ACCESS_RULES: &str = "AccessRules";
pub const SPECIAL_FULL_COPIES: &str = "FullCopies";

/// Built-in fields of a resolved user. User-attribute rules may not shadow
/// these.
pub const BUILTIN_USER_FIELDS: [&str; 6] =
  ["Access", "UserID", "Email", "Name", "LinkKey", "Origin"];

/// Link parameters driving owner-only impersonation.
pub const LINK_AS_USER_ID: &str = "aclAsUserId";
pub const LINK_AS_USER: &str = "aclAsUser";

#[inline]
pub fn is_structural_table(table_id: &str) -> bool {
  return STRUCTURAL_TABLES.contains(&table_id);
}

#[inline]
pub fn is_acl_table(table_id: &str) -> bool {
  return table_id == ACL_RESOURCES_TABLE || table_id == ACL_RULES_TABLE;
}

#[inline]
pub fn is_censorable_table(table_id: &str) -> bool {
  return CENSORABLE_TABLES.contains(&table_id);
}

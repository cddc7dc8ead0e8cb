use serde::{Deserialize, Serialize};

/// One permission verdict. `Mixed` means "decide per row" when no record is
/// bound, or "rules conflict per column" on table-level summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Perm {
  Allow,
  Deny,
  Mixed,
}

/// The five permission axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionBit {
  Read,
  Update,
  Create,
  Delete,
  SchemaEdit,
}

pub const ALL_BITS: [PermissionBit; 5] = [
  PermissionBit::Read,
  PermissionBit::Update,
  PermissionBit::Create,
  PermissionBit::Delete,
  PermissionBit::SchemaEdit,
];

impl PermissionBit {
  /// Single-letter encoding used in rule rows.
  pub fn short_code(&self) -> char {
    return match self {
      PermissionBit::Create => 'C',
      PermissionBit::Read => 'R',
      PermissionBit::Update => 'U',
      PermissionBit::Delete => 'D',
      PermissionBit::SchemaEdit => 'S',
    };
  }

  fn from_short_code(c: char) -> Option<PermissionBit> {
    return match c {
      'C' => Some(PermissionBit::Create),
      'R' => Some(PermissionBit::Read),
      'U' => Some(PermissionBit::Update),
      'D' => Some(PermissionBit::Delete),
      'S' => Some(PermissionBit::SchemaEdit),
      _ => None,
    };
  }
}

/// Permission verdicts with unset bits. Merging is first-explicit-wins per
/// bit, which makes rule evaluation a single ordered pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PartialPermissionSet {
  pub read: Option<Perm>,
  pub update: Option<Perm>,
  pub create: Option<Perm>,
  pub delete: Option<Perm>,
  pub schema_edit: Option<Perm>,
}

impl PartialPermissionSet {
  pub fn get(&self, bit: PermissionBit) -> Option<Perm> {
    return match bit {
      PermissionBit::Read => self.read,
      PermissionBit::Update => self.update,
      PermissionBit::Create => self.create,
      PermissionBit::Delete => self.delete,
      PermissionBit::SchemaEdit => self.schema_edit,
    };
  }

  pub fn set(&mut self, bit: PermissionBit, value: Perm) {
    let slot = match bit {
      PermissionBit::Read => &mut self.read,
      PermissionBit::Update => &mut self.update,
      PermissionBit::Create => &mut self.create,
      PermissionBit::Delete => &mut self.delete,
      PermissionBit::SchemaEdit => &mut self.schema_edit,
    };
    *slot = Some(value);
  }

  pub fn is_complete(&self) -> bool {
    return ALL_BITS.iter().all(|bit| self.get(*bit).is_some());
  }

  /// Fill any unset bit of `self` from `delta`. Bits already decided keep
  /// their value.
  pub fn merge_first_wins(&mut self, delta: &PartialPermissionSet) {
    for bit in ALL_BITS {
      if self.get(bit).is_none() {
        if let Some(value) = delta.get(bit) {
          self.set(bit, value);
        }
      }
    }
  }

  /// Mark every bit `delta` touches as `Mixed`, unless already decided. Used
  /// when a rule's predicate cannot be evaluated without a record: whether
  /// the rule matches now depends on the row.
  pub fn merge_indeterminate(&mut self, delta: &PartialPermissionSet) {
    for bit in ALL_BITS {
      if self.get(bit).is_none() && delta.get(bit).is_some() {
        self.set(bit, Perm::Mixed);
      }
    }
  }

  /// Uniform set with every bit at `value`.
  pub fn uniform(value: Perm) -> Self {
    let mut set = PartialPermissionSet::default();
    for bit in ALL_BITS {
      set.set(bit, value);
    }
    return set;
  }

  /// Parse the compact bit-string encoding of rule rows, e.g. `"+R"`,
  /// `"-CUD"`, `"+R-S"`. `"all"` and `"none"` are shorthands.
  pub fn parse(code: &str) -> Result<Self, String> {
    match code {
      "all" => return Ok(Self::uniform(Perm::Allow)),
      "none" => return Ok(Self::uniform(Perm::Deny)),
      _ => {}
    }

    let mut set = PartialPermissionSet::default();
    let mut current: Option<Perm> = None;
    for c in code.chars() {
      match c {
        '+' => current = Some(Perm::Allow),
        '-' => current = Some(Perm::Deny),
        _ => {
          let Some(bit) = PermissionBit::from_short_code(c) else {
            return Err(format!("invalid permission character {c:?} in {code:?}"));
          };
          let Some(value) = current else {
            return Err(format!("permission bit before +/- sign in {code:?}"));
          };
          if set.get(bit).is_some() {
            return Err(format!("duplicate permission bit {c:?} in {code:?}"));
          }
          set.set(bit, value);
        }
      }
    }
    return Ok(set);
  }
}

/// Fully-resolved verdict on all five axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionSet {
  pub read: Perm,
  pub update: Perm,
  pub create: Perm,
  pub delete: Perm,
  pub schema_edit: Perm,
}

impl PermissionSet {
  pub fn uniform(value: Perm) -> Self {
    return PermissionSet {
      read: value,
      update: value,
      create: value,
      delete: value,
      schema_edit: value,
    };
  }

  pub fn get(&self, bit: PermissionBit) -> Perm {
    return match bit {
      PermissionBit::Read => self.read,
      PermissionBit::Update => self.update,
      PermissionBit::Create => self.create,
      PermissionBit::Delete => self.delete,
      PermissionBit::SchemaEdit => self.schema_edit,
    };
  }

  fn set(&mut self, bit: PermissionBit, value: Perm) {
    match bit {
      PermissionBit::Read => self.read = value,
      PermissionBit::Update => self.update = value,
      PermissionBit::Create => self.create = value,
      PermissionBit::Delete => self.delete = value,
      PermissionBit::SchemaEdit => self.schema_edit = value,
    }
  }

  /// Combine per-resource verdicts into a summary: agreeing bits keep their
  /// value, disagreeing bits become `Mixed`.
  pub fn agreement(&self, other: &PermissionSet) -> PermissionSet {
    let mut result = *self;
    for bit in ALL_BITS {
      if self.get(bit) != other.get(bit) {
        result.set(bit, Perm::Mixed);
      }
    }
    return result;
  }
}

impl From<PartialPermissionSet> for PermissionSet {
  /// Close a partial set; any bit still unset is an engine bug upstream (the
  /// implicit default rules always complete the set), so fall back to deny.
  fn from(partial: PartialPermissionSet) -> Self {
    let mut set = PermissionSet::uniform(Perm::Deny);
    for bit in ALL_BITS {
      if let Some(value) = partial.get(bit) {
        set.set(bit, value);
      }
    }
    return set;
  }
}

/// Which kind of rule set produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleType {
  Table,
  Column,
  Row,
  Special,
}

/// A resolved verdict plus the context ingress errors need: where it came
/// from and the memos of any denying rules along the way.
#[derive(Debug, Clone)]
pub struct PermissionSetWithContext {
  pub perms: PermissionSet,
  pub rule_type: RuleType,
  pub memos: Vec<String>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_codes() {
    let set = PartialPermissionSet::parse("+R").unwrap();
    assert_eq!(set.read, Some(Perm::Allow));
    assert_eq!(set.update, None);

    let set = PartialPermissionSet::parse("-CUD").unwrap();
    assert_eq!(set.create, Some(Perm::Deny));
    assert_eq!(set.update, Some(Perm::Deny));
    assert_eq!(set.delete, Some(Perm::Deny));
    assert_eq!(set.read, None);

    let set = PartialPermissionSet::parse("+R-S").unwrap();
    assert_eq!(set.read, Some(Perm::Allow));
    assert_eq!(set.schema_edit, Some(Perm::Deny));

    assert_eq!(
      PartialPermissionSet::parse("all").unwrap(),
      PartialPermissionSet::uniform(Perm::Allow)
    );

    assert!(PartialPermissionSet::parse("+X").is_err());
    assert!(PartialPermissionSet::parse("R").is_err());
    assert!(PartialPermissionSet::parse("+RR").is_err());
  }

  #[test]
  fn test_first_explicit_wins() {
    let mut set = PartialPermissionSet::parse("+R").unwrap();
    set.merge_first_wins(&PartialPermissionSet::parse("-RU").unwrap());
    // Read was already decided; update was not.
    assert_eq!(set.read, Some(Perm::Allow));
    assert_eq!(set.update, Some(Perm::Deny));
  }

  #[test]
  fn test_indeterminate_marks_mixed() {
    let mut set = PartialPermissionSet::parse("+U").unwrap();
    set.merge_indeterminate(&PartialPermissionSet::parse("-RU").unwrap());
    assert_eq!(set.read, Some(Perm::Mixed));
    assert_eq!(set.update, Some(Perm::Allow));
  }

  #[test]
  fn test_agreement() {
    let allow = PermissionSet::uniform(Perm::Allow);
    let mut other = PermissionSet::uniform(Perm::Allow);
    other.read = Perm::Deny;
    let merged = allow.agreement(&other);
    assert_eq!(merged.read, Perm::Mixed);
    assert_eq!(merged.update, Perm::Allow);
  }
}

//! Construction variables and `${name}` reference expansion.
//!
//! A [`VarSet`] maps variable names to [`Value`]s. Expansion resolves
//! `${name}` references embedded in strings, producing flat lists of
//! strings. A reference to a sequence value multiplies the surrounding
//! text across every element.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A function computing a variable's value on demand from the current set.
pub type LazyFn = Arc<dyn Fn(&VarSet) -> Value + Send + Sync>;

/// A construction variable value.
#[derive(Clone)]
pub enum Value {
  /// A string, possibly containing `${name}` references.
  Str(String),
  /// A sequence of values, expanded element-wise and flattened.
  List(Vec<Value>),
  /// A map value. Storable and retrievable, but not referenceable from a
  /// string expansion.
  Map(HashMap<String, Value>),
  /// A deferred value, computed against the expanding set when referenced.
  Lazy(LazyFn),
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Value::Str(s) => f.debug_tuple("Str").field(s).finish(),
      Value::List(items) => f.debug_tuple("List").field(items).finish(),
      Value::Map(map) => f.debug_tuple("Map").field(map).finish(),
      Value::Lazy(_) => f.write_str("Lazy(..)"),
    }
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_owned())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

impl From<Vec<String>> for Value {
  fn from(items: Vec<String>) -> Self {
    Value::List(items.into_iter().map(Value::Str).collect())
  }
}

impl From<&[&str]> for Value {
  fn from(items: &[&str]) -> Self {
    Value::List(items.iter().map(|s| Value::from(*s)).collect())
  }
}

/// Errors raised during variable expansion.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpandError {
  /// A `${name}` reference named a variable that is not set.
  #[error("undefined construction variable {0}")]
  Undefined(String),

  /// Expansion reached a value with no string form.
  #[error("cannot expand value of variable {0}")]
  Unexpandable(String),
}

/// An ordered-insensitive collection of construction variables.
#[derive(Clone, Debug, Default)]
pub struct VarSet {
  vars: HashMap<String, Value>,
}

impl VarSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, name: &str) -> Option<&Value> {
    self.vars.get(name)
  }

  pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.vars.insert(name.into(), value.into());
  }

  /// Set a variable only if it is not already set.
  pub fn set_default(&mut self, name: impl Into<String>, value: impl Into<Value>) {
    self.vars.entry(name.into()).or_insert_with(|| value.into());
  }

  pub fn contains(&self, name: &str) -> bool {
    self.vars.contains_key(name)
  }

  /// Overlay another set onto this one; the other set's values win.
  pub fn append(&mut self, other: &VarSet) {
    for (name, value) in &other.vars {
      self.vars.insert(name.clone(), value.clone());
    }
  }

  /// Build a new set with `other` overlaid on this one. Neither input is
  /// modified, and the result shares no mutable state with either.
  pub fn merge(&self, other: &VarSet) -> VarSet {
    let mut merged = self.clone();
    merged.append(other);
    merged
  }

  pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
    self.vars.iter()
  }

  /// Expand a value into a flat list of strings.
  ///
  /// Strings have their `${name}` references substituted; lists are
  /// expanded element-wise and flattened; lazy values are invoked against
  /// this set and their result expanded; maps are not expandable.
  pub fn expand(&self, value: &Value) -> Result<Vec<String>, ExpandError> {
    match value {
      Value::Str(s) => self.expand_str(s),
      Value::List(items) => {
        let mut out = Vec::new();
        for item in items {
          out.extend(self.expand(item)?);
        }
        Ok(out)
      }
      Value::Lazy(f) => {
        let computed = f(self);
        self.expand(&computed)
      }
      Value::Map(_) => Err(ExpandError::Unexpandable("<map literal>".to_owned())),
    }
  }

  /// Expand every `${name}` reference in a string.
  ///
  /// A reference to a list value produces one output string per element,
  /// each carrying the surrounding prefix and suffix text, so multiple
  /// list references in one string multiply combinatorially.
  pub fn expand_str(&self, s: &str) -> Result<Vec<String>, ExpandError> {
    let Some((prefix, name, suffix)) = split_reference(s) else {
      return Ok(vec![s.to_owned()]);
    };

    let mut value = self
      .vars
      .get(name)
      .cloned()
      .ok_or_else(|| ExpandError::Undefined(name.to_owned()))?;
    while let Value::Lazy(f) = value {
      value = f(self);
    }

    let elements = match value {
      Value::Str(v) => vec![v],
      Value::List(_) => self.expand(&value)?,
      Value::Map(_) => return Err(ExpandError::Unexpandable(name.to_owned())),
      Value::Lazy(_) => unreachable!(),
    };

    let mut out = Vec::new();
    for element in elements {
      out.extend(self.expand_str(&format!("{prefix}{element}{suffix}"))?);
    }
    Ok(out)
  }
}

/// Split a string around its first `${name}` reference.
fn split_reference(s: &str) -> Option<(&str, &str, &str)> {
  let start = s.find("${")?;
  let end = s[start..].find('}')? + start;
  Some((&s[..start], &s[start + 2..end], &s[end + 1..]))
}

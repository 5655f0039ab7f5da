//! Structural query keys.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// One primitive component of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
}

impl From<&str> for KeyPart {
  fn from(value: &str) -> Self {
    Self::Str(value.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(value: String) -> Self {
    Self::Str(value)
  }
}

impl From<&String> for KeyPart {
  fn from(value: &String) -> Self {
    Self::Str(value.clone())
  }
}

impl From<i64> for KeyPart {
  fn from(value: i64) -> Self {
    Self::Int(value)
  }
}

impl From<i32> for KeyPart {
  fn from(value: i32) -> Self {
    Self::Int(i64::from(value))
  }
}

impl From<u32> for KeyPart {
  fn from(value: u32) -> Self {
    Self::Int(i64::from(value))
  }
}

impl From<bool> for KeyPart {
  fn from(value: bool) -> Self {
    Self::Bool(value)
  }
}

/// `None` maps to [`KeyPart::Null`], so `["products", viewer]` stays a
/// distinct key for anonymous viewers.
impl<V: Into<KeyPart>> From<Option<V>> for KeyPart {
  fn from(value: Option<V>) -> Self {
    value.map(Into::into).unwrap_or(Self::Null)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => f.write_str("null"),
      Self::Bool(b) => write!(f, "{}", b),
      Self::Int(i) => write!(f, "{}", i),
      Self::Str(s) => write!(f, "{:?}", s),
    }
  }
}

/// Identifies a cached query result, e.g. `["products", "user_1"]`.
///
/// Equality is structural over the ordered parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new(parts: impl IntoIterator<Item = KeyPart>) -> Self {
    Self(parts.into_iter().collect())
  }

  /// Append a part, builder style.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True if `prefix` matches the leading parts of this key.
  /// The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }

  /// Stable short fingerprint, used as a log field.
  pub fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.to_string().as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..16].to_string()
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{}", part)?;
    }
    f.write_str("]")
  }
}

impl<P: Into<KeyPart>> FromIterator<P> for QueryKey {
  fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
    Self(iter.into_iter().map(Into::into).collect())
  }
}

/// Build a [`QueryKey`] from heterogeneous parts.
///
/// ```
/// use qcache::query_key;
/// let key = query_key!("products", Some("user_1"));
/// assert_eq!(key.to_string(), r#"["products", "user_1"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
  ($($part:expr),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::KeyPart::from($part)),*])
  };
}

//! Spaces, primary keys and indexes.

use crate::error::CoreError;
use rmpv::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

/// A stored record.
pub type Tuple = Vec<Value>;

/// Primary key: the first field of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Key {
    Bool(bool),
    /// Negative integers only; non-negative ones are `Unsigned`.
    Integer(i64),
    Unsigned(u64),
    Str(String),
    Bin(Vec<u8>),
}

impl Key {
    pub fn from_value(value: &Value) -> Result<Self, CoreError> {
        if let Some(n) = value.as_u64() {
            return Ok(Key::Unsigned(n));
        }
        if let Some(n) = value.as_i64() {
            return Ok(Key::Integer(n));
        }
        match value {
            Value::Boolean(b) => Ok(Key::Bool(*b)),
            Value::String(s) => s
                .as_str()
                .map(|s| Key::Str(s.to_string()))
                .ok_or_else(|| CoreError::InvalidKey {
                    reason: "string key is not valid UTF-8".to_string(),
                }),
            Value::Binary(b) => Ok(Key::Bin(b.clone())),
            other => Err(CoreError::InvalidKey {
                reason: format!("unsupported key type: {other}"),
            }),
        }
    }

    /// Extracts the primary key of `tuple`.
    pub fn of_tuple(tuple: &[Value]) -> Result<Self, CoreError> {
        let first = tuple.first().ok_or_else(|| CoreError::InvalidTuple {
            reason: "tuple has no primary key field".to_string(),
        })?;
        Self::from_value(first)
    }

    /// Parses a single-part key; an empty key selects everything.
    pub fn from_parts(parts: &[Value]) -> Result<Option<Self>, CoreError> {
        match parts {
            [] => Ok(None),
            [part] => Self::from_value(part).map(Some),
            _ => Err(CoreError::InvalidKey {
                reason: format!("expected 1 key part, got {}", parts.len()),
            }),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Bool(b) => write!(f, "{b}"),
            Key::Integer(n) => write!(f, "{n}"),
            Key::Unsigned(n) => write!(f, "{n}"),
            Key::Str(s) => write!(f, "{s:?}"),
            Key::Bin(b) => write!(f, "0x{}", hex_string(b)),
        }
    }
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Primary index implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexKind {
    /// Ordered; selects return tuples in key order.
    Tree,
    /// Unordered.
    Hash,
}

impl IndexKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Tree => "tree",
            IndexKind::Hash => "hash",
        }
    }
}

impl FromStr for IndexKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tree" => Ok(IndexKind::Tree),
            "hash" => Ok(IndexKind::Hash),
            other => Err(CoreError::InvalidTuple {
                reason: format!("unknown index kind: {other}"),
            }),
        }
    }
}

/// Primary index storage.
#[derive(Debug, Clone)]
pub enum Index {
    Tree(BTreeMap<Key, Tuple>),
    Hash(HashMap<Key, Tuple>),
}

impl Index {
    pub fn new(kind: IndexKind) -> Self {
        match kind {
            IndexKind::Tree => Index::Tree(BTreeMap::new()),
            IndexKind::Hash => Index::Hash(HashMap::new()),
        }
    }

    pub fn get(&self, key: &Key) -> Option<&Tuple> {
        match self {
            Index::Tree(map) => map.get(key),
            Index::Hash(map) => map.get(key),
        }
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.get(key).is_some()
    }

    pub fn insert(&mut self, key: Key, tuple: Tuple) -> Option<Tuple> {
        match self {
            Index::Tree(map) => map.insert(key, tuple),
            Index::Hash(map) => map.insert(key, tuple),
        }
    }

    pub fn remove(&mut self, key: &Key) -> Option<Tuple> {
        match self {
            Index::Tree(map) => map.remove(key),
            Index::Hash(map) => map.remove(key),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Index::Tree(map) => map.len(),
            Index::Hash(map) => map.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored tuple, whatever the index kind.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Tuple> + '_> {
        match self {
            Index::Tree(map) => Box::new(map.values()),
            Index::Hash(map) => Box::new(map.values()),
        }
    }
}

/// Space metadata, stored as a tuple `[id, name, index_kind]` in the
/// system space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceDef {
    pub id: u32,
    pub name: String,
    pub index: IndexKind,
}

impl SpaceDef {
    pub fn new(id: u32, name: impl Into<String>, index: IndexKind) -> Self {
        Self {
            id,
            name: name.into(),
            index,
        }
    }

    pub fn to_tuple(&self) -> Tuple {
        vec![
            Value::from(self.id),
            Value::from(self.name.as_str()),
            Value::from(self.index.as_str()),
        ]
    }

    pub fn from_tuple(tuple: &[Value]) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidTuple {
            reason: format!("space definition {reason}"),
        };
        let id = tuple
            .first()
            .and_then(Value::as_u64)
            .and_then(|id| u32::try_from(id).ok())
            .ok_or_else(|| invalid("needs a u32 id"))?;
        let name = tuple
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("needs a name"))?;
        let index = match tuple.get(2) {
            Some(kind) => kind
                .as_str()
                .ok_or_else(|| invalid("index kind must be a string"))?
                .parse()?,
            None => IndexKind::Tree,
        };
        Ok(Self::new(id, name, index))
    }
}

/// A space and its primary index.
#[derive(Debug, Clone)]
pub struct Space {
    pub def: SpaceDef,
    pub index: Index,
}

impl Space {
    pub fn new(def: SpaceDef) -> Self {
        let index = Index::new(def.index);
        Self { def, index }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Tuples matching `key` (all tuples when `None`), after `offset`, at
    /// most `limit`.
    pub fn select(&self, key: Option<&Key>, offset: usize, limit: usize) -> Vec<Tuple> {
        match key {
            Some(key) => self
                .index
                .get(key)
                .into_iter()
                .skip(offset)
                .take(limit)
                .cloned()
                .collect(),
            None => self.index.iter().skip(offset).take(limit).cloned().collect(),
        }
    }
}

/// Applies upsert operations to `tuple`.
///
/// Each operation is `[op, field, argument]` with a 0-based field number;
/// `=` assigns, `+` and `-` do numeric arithmetic. The primary key field
/// cannot be changed.
pub fn apply_ops(tuple: &[Value], ops: &[Value]) -> Result<Tuple, CoreError> {
    let mut out = tuple.to_vec();
    for op in ops {
        let invalid = |reason: String| CoreError::InvalidOps { reason };
        let parts = op
            .as_array()
            .ok_or_else(|| invalid(format!("operation must be an array, got {op}")))?;
        let [code, field, arg] = parts.as_slice() else {
            return Err(invalid(format!("expected [op, field, arg], got {op}")));
        };
        let code = code
            .as_str()
            .ok_or_else(|| invalid(format!("operator must be a string, got {code}")))?;
        let field = field
            .as_u64()
            .map(|f| f as usize)
            .ok_or_else(|| invalid(format!("field must be unsigned, got {field}")))?;
        if field == 0 {
            return Err(invalid("cannot update the primary key".to_string()));
        }

        let updated = match code {
            "=" => arg.clone(),
            "+" | "-" => {
                let current = out
                    .get(field)
                    .ok_or_else(|| invalid(format!("field {field} does not exist")))?;
                arithmetic(code, current, arg).ok_or_else(|| {
                    invalid(format!("cannot apply {code} to {current} and {arg}"))
                })?
            }
            other => return Err(invalid(format!("unknown operator {other:?}"))),
        };

        match field.cmp(&out.len()) {
            std::cmp::Ordering::Less => out[field] = updated,
            std::cmp::Ordering::Equal => out.push(updated),
            std::cmp::Ordering::Greater => {
                return Err(invalid(format!(
                    "field {field} is past the end of a {}-field tuple",
                    out.len()
                )))
            }
        }
    }
    Ok(out)
}

fn arithmetic(code: &str, lhs: &Value, rhs: &Value) -> Option<Value> {
    if let (Some(a), Some(b)) = (lhs.as_u64(), rhs.as_u64()) {
        let result = match code {
            "+" => a.checked_add(b).map(Value::from),
            _ if a >= b => Some(Value::from(a - b)),
            _ => i64::try_from(b - a).ok().map(|d| Value::from(-d)),
        };
        return result;
    }
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        return match code {
            "+" => a.checked_add(b).map(Value::from),
            _ => a.checked_sub(b).map(Value::from),
        };
    }
    let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
    Some(Value::from(if code == "+" { a + b } else { a - b }))
}

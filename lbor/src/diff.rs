use crate::decoder::DecodeError;
use crate::encoder::EncodeError;
use crate::value::Value;
use crate::{lbor_decode, lbor_encode};

/// Canonical delta between two values.
///
/// Maps diff structurally, entry by entry; every other kind (including
/// arrays, whose element positions are not stable identities) replaces
/// wholesale. `apply(before, diff(before, after)) == after` always holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueDiff {
    Unchanged,
    Replace(Value),
    MapPatch {
        added: Vec<(String, Value)>,
        removed: Vec<String>,
        changed: Vec<(String, ValueDiff)>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiffError {
    NotAMap,
    MissingKey(String),
    KeyAlreadyPresent(String),
    MalformedDiff,
}

/// Computes the canonical delta such that applying it to `before`
/// yields `after`.
pub fn diff(before: &Value, after: &Value) -> ValueDiff {
    if before == after {
        return ValueDiff::Unchanged;
    }
    match (before, after) {
        (Value::Map(before_entries), Value::Map(after_entries)) => {
            let mut added = Vec::new();
            let mut removed = Vec::new();
            let mut changed = Vec::new();
            for (key, before_value) in before_entries {
                match after_entries.iter().find(|(k, _)| k == key) {
                    None => removed.push(key.clone()),
                    Some((_, after_value)) => {
                        if before_value != after_value {
                            changed.push((key.clone(), diff(before_value, after_value)));
                        }
                    }
                }
            }
            for (key, after_value) in after_entries {
                if !before_entries.iter().any(|(k, _)| k == key) {
                    added.push((key.clone(), after_value.clone()));
                }
            }
            ValueDiff::MapPatch {
                added,
                removed,
                changed,
            }
        }
        _ => ValueDiff::Replace(after.clone()),
    }
}

/// Applies a delta to a pre-image.
pub fn apply(before: &Value, diff: &ValueDiff) -> Result<Value, DiffError> {
    match diff {
        ValueDiff::Unchanged => Ok(before.clone()),
        ValueDiff::Replace(after) => Ok(after.clone()),
        ValueDiff::MapPatch {
            added,
            removed,
            changed,
        } => {
            let entries = match before {
                Value::Map(entries) => entries,
                _ => return Err(DiffError::NotAMap),
            };
            let mut result: Vec<(String, Value)> = Vec::with_capacity(entries.len());
            for (key, value) in entries {
                if removed.contains(key) {
                    continue;
                }
                match changed.iter().find(|(k, _)| k == key) {
                    Some((_, sub)) => result.push((key.clone(), apply(value, sub)?)),
                    None => result.push((key.clone(), value.clone())),
                }
            }
            for key in removed {
                if !entries.iter().any(|(k, _)| k == key) {
                    return Err(DiffError::MissingKey(key.clone()));
                }
            }
            for (key, _) in changed {
                if !entries.iter().any(|(k, _)| k == key) {
                    return Err(DiffError::MissingKey(key.clone()));
                }
            }
            for (key, value) in added {
                if entries.iter().any(|(k, _)| k == key) {
                    return Err(DiffError::KeyAlreadyPresent(key.clone()));
                }
                result.push((key.clone(), value.clone()));
            }
            Ok(Value::map(result))
        }
    }
}

impl ValueDiff {
    /// Wire form: a single-entry map tagged `"u"` / `"r"` / `"p"`.
    pub fn to_value(&self) -> Value {
        match self {
            ValueDiff::Unchanged => Value::map(vec![("u".to_owned(), Value::Null)]),
            ValueDiff::Replace(v) => Value::map(vec![("r".to_owned(), v.clone())]),
            ValueDiff::MapPatch {
                added,
                removed,
                changed,
            } => {
                let body = Value::map(vec![
                    ("a".to_owned(), Value::map(added.clone())),
                    (
                        "c".to_owned(),
                        Value::map(
                            changed
                                .iter()
                                .map(|(k, d)| (k.clone(), d.to_value()))
                                .collect(),
                        ),
                    ),
                    (
                        "d".to_owned(),
                        Value::Array(removed.iter().map(|k| Value::String(k.clone())).collect()),
                    ),
                ]);
                Value::map(vec![("p".to_owned(), body)])
            }
        }
    }

    pub fn from_value(value: &Value) -> Result<Self, DiffError> {
        let entries = value.as_map().ok_or(DiffError::MalformedDiff)?;
        if entries.len() != 1 {
            return Err(DiffError::MalformedDiff);
        }
        let (tag, body) = &entries[0];
        match tag.as_str() {
            "u" => Ok(ValueDiff::Unchanged),
            "r" => Ok(ValueDiff::Replace(body.clone())),
            "p" => {
                let added = body
                    .map_get("a")
                    .and_then(|v| v.as_map())
                    .ok_or(DiffError::MalformedDiff)?
                    .to_vec();
                let changed = body
                    .map_get("c")
                    .and_then(|v| v.as_map())
                    .ok_or(DiffError::MalformedDiff)?
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), ValueDiff::from_value(v)?)))
                    .collect::<Result<Vec<_>, DiffError>>()?;
                let removed = body
                    .map_get("d")
                    .and_then(|v| v.as_array())
                    .ok_or(DiffError::MalformedDiff)?
                    .iter()
                    .map(|v| v.as_str().map(|s| s.to_owned()).ok_or(DiffError::MalformedDiff))
                    .collect::<Result<Vec<_>, DiffError>>()?;
                Ok(ValueDiff::MapPatch {
                    added,
                    removed,
                    changed,
                })
            }
            _ => Err(DiffError::MalformedDiff),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        lbor_encode(&self.to_value())
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value = lbor_decode(bytes)?;
        ValueDiff::from_value(&value).map_err(|_| DecodeError::InvalidSize)
    }
}

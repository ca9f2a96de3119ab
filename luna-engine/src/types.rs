//! Internal prelude. Every engine module pulls this in as `crate::types::*`.

pub use indexmap::{IndexMap, IndexSet};
pub use std::collections::BTreeMap;
pub use std::fmt;
pub use std::sync::Arc;

pub use luna_common::prelude::*;

pub use crate::errors::*;
pub use crate::value::{
    FunctionRef, StringRef, TableKey, TableRef, ThreadRef, UpvalueRef, UserdataRef, Value,
};

pub fn index_map_new<K, V>() -> IndexMap<K, V> {
    IndexMap::new()
}

pub fn index_set_new<T>() -> IndexSet<T> {
    IndexSet::new()
}

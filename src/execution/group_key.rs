use std::{cmp::Ordering, fmt::Display, hash::{Hash, Hasher}, sync::Arc};

use itertools::Itertools;

use crate::types::{DataType, Time, Value};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColMeta {
    pub label: String,
    pub data_type: DataType,
}

impl ColMeta {
    pub fn new(label: impl Into<String>, data_type: DataType) -> ColMeta {
        ColMeta { label: label.into(), data_type }
    }
}

#[derive(Debug)]
struct GroupKeyInner {
    cols: Vec<ColMeta>,
    values: Vec<Value>,
    // column indexes ordered by label
    sorted: Vec<usize>,
}

/// The set of (label, value) pairs identifying a group of rows.
///
/// Keys are immutable and cheap to clone. Equality does not depend on the order
/// the columns were given in.
#[derive(Debug, Clone)]
pub struct GroupKey(Arc<GroupKeyInner>);

impl GroupKey {
    pub fn new(cols: Vec<ColMeta>, values: Vec<Value>) -> GroupKey {
        let mut sorted: Vec<usize> = (0..cols.len().min(values.len())).collect();
        sorted.sort_by(|a, b| cols[*a].label.cmp(&cols[*b].label));
        GroupKey(Arc::new(GroupKeyInner { cols, values, sorted }))
    }

    pub fn empty() -> GroupKey {
        GroupKey::new(Vec::new(), Vec::new())
    }

    /// Builds a key from pairs, the column type is taken from the value.
    /// Null values get the string type.
    pub fn from_pairs<L: Into<String>>(pairs: impl IntoIterator<Item = (L, Value)>) -> GroupKey {
        let (cols, values) = pairs.into_iter()
            .map(|(label, value)| {
                let data_type = value.data_type().unwrap_or(DataType::String);
                (ColMeta::new(label, data_type), value)
            })
            .unzip();
        GroupKey::new(cols, values)
    }

    pub fn cols(&self) -> &[ColMeta] {
        &self.0.cols
    }

    pub fn values(&self) -> &[Value] {
        &self.0.values
    }

    pub fn len(&self) -> usize {
        self.0.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        let inner = &self.0;
        inner.sorted
            .binary_search_by(|i| inner.cols[*i].label.as_str().cmp(label))
            .ok()
            .map(|pos| &inner.values[inner.sorted[pos]])
    }

    /// The `_stop` bound of windowed keys.
    pub fn stop(&self) -> Option<Time> {
        self.get(STOP_COL_LABEL).and_then(|v| v.as_time())
    }

    fn sorted_pairs(&self) -> impl Iterator<Item = (&ColMeta, &Value)> {
        self.0.sorted.iter().map(|i| (&self.0.cols[*i], &self.0.values[*i]))
    }
}

pub const START_COL_LABEL: &str = "_start";
pub const STOP_COL_LABEL: &str = "_stop";

impl Ord for GroupKey {
    fn cmp(&self, other: &Self) -> Ordering {
        for ((a_col, a_val), (b_col, b_val)) in self.sorted_pairs().zip(other.sorted_pairs()) {
            if a_col.label != b_col.label {
                // The key holding the larger label is missing the smaller one, and sorts first.
                return b_col.label.cmp(&a_col.label);
            }
            let ord = a_col.data_type.cmp(&b_col.data_type).then_with(|| a_val.cmp(b_val));
            if ord != Ordering::Equal {
                return ord;
            }
        }
        self.len().cmp(&other.len())
    }
}

impl PartialOrd for GroupKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for GroupKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.cmp(other) == Ordering::Equal
    }
}

impl Eq for GroupKey {}

impl Hash for GroupKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.len().hash(state);
        for (col, value) in self.sorted_pairs() {
            col.label.hash(state);
            col.data_type.hash(state);
            value.hash(state);
        }
    }
}

impl Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", self.0.cols.iter().zip(self.0.values.iter())
            .map(|(c, v)| format!("{}={}", c.label, v))
            .join(","))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key(pairs: &[(&str, &str)]) -> GroupKey {
        GroupKey::from_pairs(pairs.iter().map(|(l, v)| (*l, Value::String(v.to_string()))))
    }

    #[test]
    fn test_equal() {
        assert_eq!(key(&[("a", "b"), ("b", "c")]), key(&[("a", "b"), ("b", "c")]));
        // transposed
        assert_eq!(key(&[("a", "b"), ("b", "c")]), key(&[("b", "c"), ("a", "b")]));
        assert_ne!(key(&[("a", "b")]), key(&[("a", "c")]));
        assert_ne!(key(&[("a", "b")]), key(&[("b", "b")]));
        assert_ne!(key(&[("a", "b"), ("b", "c")]), key(&[("b", "c")]));
    }

    #[test]
    fn test_less() {
        assert!(key(&[("a", "a")]) < key(&[("a", "b")]));
        assert!(key(&[("a", "b")]) < key(&[("a", "b"), ("b", "a")]));
        // missing the "a" column sorts first
        assert!(key(&[("b", "a")]) < key(&[("a", "z")]));
        assert!(GroupKey::empty() < key(&[("a", "a")]));
    }

    #[test]
    fn test_get_and_display() {
        let k = GroupKey::from_pairs(vec![("t0", Value::String("a".to_string())), ("_stop", Value::Time(100))]);
        assert_eq!(k.stop(), Some(100));
        assert_eq!(k.get("t0"), Some(&Value::String("a".to_string())));
        assert_eq!(k.get("t1"), None);
        assert_eq!(k.to_string(), "{t0=a,_stop=100ns}");
    }
}

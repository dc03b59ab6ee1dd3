use std::{cmp::Ordering, fmt::Display, hash::{Hash, Hasher}};

// Nanoseconds since the unix epoch. Durations use the same unit.
pub type Time = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DataType {
    Bool = 0,
    Int = 1,
    UInt = 2,
    Float = 3,
    String = 4,
    Time = 5,
}

impl Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Bool => write!(f, "bool"),
            DataType::Int => write!(f, "int"),
            DataType::UInt => write!(f, "uint"),
            DataType::Float => write!(f, "float"),
            DataType::String => write!(f, "string"),
            DataType::Time => write!(f, "time"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    Time(Time),
}

impl Value {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(DataType::Bool),
            Value::Int(_) => Some(DataType::Int),
            Value::UInt(_) => Some(DataType::UInt),
            Value::Float(_) => Some(DataType::Float),
            Value::String(_) => Some(DataType::String),
            Value::Time(_) => Some(DataType::Time),
        }
    }

    pub fn as_time(&self) -> Option<Time> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    // Null sorts before everything, then values are grouped by their type
    fn type_rank(&self) -> u8 {
        match self.data_type() {
            None => 0,
            Some(t) => t as u8 + 1,
        }
    }
}

// Unlike the comparison operators on f64 this is a total order (NaN == NaN) so that
// values can be used inside sorted group keys.
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::UInt(a), Value::UInt(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_rank().hash(state);
        match self {
            Value::Null => {},
            Value::Bool(b) => b.hash(state),
            Value::Int(i) => i.hash(state),
            Value::UInt(u) => u.hash(state),
            Value::Float(f) => f.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::Time(t) => t.hash(state),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::UInt(u) => write!(f, "{}", u),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Time(t) => write!(f, "{}ns", t),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_value_order() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Int(-1) < Value::Int(3));
        assert!(Value::Int(100) < Value::UInt(0));
        assert!(Value::String("a".to_string()) < Value::String("b".to_string()));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert!(Value::Float(-0.5) < Value::Float(0.5));
    }

    #[test]
    fn test_data_type() {
        assert_eq!(Value::Time(5).data_type(), Some(DataType::Time));
        assert_eq!(Value::Null.data_type(), None);
        assert_eq!(Value::Time(7).as_time(), Some(7));
        assert_eq!(Value::Int(7).as_time(), None);
    }
}

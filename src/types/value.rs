//! # 结果集的基础值类型
//!
//! 本模块只描述**外部执行器返回的数据**，本系统自身从不存储数据。
//!
//! ## 主要组成
//! - `DataType`：受限的原始 SQL 类型枚举（`Boolean`/`Integer`/`Float`/`String`）。
//! - `Value`：SQL 值的统一承载（含 `Null`）。
//!   - 聚合合并只关心数值：`as_f64()` 把整型和浮点统一成 `f64`；
//!   - `Null` 在求和时视为 0，在 min/max 时被忽略；
//!   - 分组键需要 `Eq + Hash + Ord`，浮点按 `to_bits` 比较，与 `ast::Literal` 一致。

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

/// 原始的 SQL 数据类型。
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    /// 布尔类型：true/false
    Boolean,
    /// 64bit有符号整形
    Integer,
    /// 浮点类型
    Float,
    /// UTF-8编码的字符串
    String,
}

impl Display for DataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Integer => write!(f, "INTEGER"),
            DataType::Float => write!(f, "DOUBLE"),
            DataType::String => write!(f, "VARCHAR"),
        }
    }
}

/// 结果集中的单个值
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl Value {
    /// 值对应的类型，`Null` 没有类型
    pub fn datatype(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Float(_) => Some(DataType::Float),
            Value::String(_) => Some(DataType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// 数值视图，非数值返回 None
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::Null | Value::String(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    /// 两个数值相加，整型相加保持整型
    /// 遇到 `Null` 时返回另一边
    pub fn checked_add(&self, other: &Value) -> crate::db_error::Result<Value> {
        Ok(match (self, other) {
            (Value::Null, v) | (v, Value::Null) => v.clone(),
            (Value::Integer(a), Value::Integer(b)) => match a.checked_add(*b) {
                Some(sum) => Value::Integer(sum),
                None => Value::Float(*a as f64 + *b as f64),
            },
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => Value::Float(x + y),
                _ => return Err(crate::errdata!("can't add {a} and {b}")),
            },
        })
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Boolean(true) => f.write_str("TRUE"),
            Value::Boolean(false) => f.write_str("FALSE"),
            Value::Integer(i) => i.fmt(f),
            Value::Float(v) => v.fmt(f),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Integer(a), Value::Float(b)) | (Value::Float(b), Value::Integer(a)) => {
                (*a as f64).to_bits() == b.to_bits()
            }
            (Value::String(a), Value::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // 整型与等值浮点需要同一个哈希，统一按 f64 的位模式处理
        match self {
            Value::Null => 0u8.hash(state),
            Value::Boolean(b) => {
                1u8.hash(state);
                b.hash(state)
            }
            Value::Integer(i) => {
                2u8.hash(state);
                (*i as f64).to_bits().hash(state)
            }
            Value::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state)
            }
            Value::String(s) => {
                3u8.hash(state);
                s.hash(state)
            }
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// 跨类型的全序：`String > Integer/Float > Boolean > Null`
impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        use Value::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Boolean(a), Boolean(b)) => a.cmp(b),
            (Integer(a), Integer(b)) => a.cmp(b),
            (String(a), String(b)) => a.cmp(b),
            (Integer(_) | Float(_), Integer(_) | Float(_)) => {
                let (x, y) = (self.as_f64().unwrap_or_default(), other.as_f64().unwrap_or_default());
                x.total_cmp(&y)
            }
            (Null, _) => Ordering::Less,
            (_, Null) => Ordering::Greater,
            (Boolean(_), _) => Ordering::Less,
            (_, Boolean(_)) => Ordering::Greater,
            (Integer(_) | Float(_), String(_)) => Ordering::Less,
            (String(_), Integer(_) | Float(_)) => Ordering::Greater,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_equality() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_ne!(Value::Integer(3), Value::String("3".into()));
    }

    #[test]
    fn test_checked_add() {
        assert_eq!(Value::Integer(30).checked_add(&Value::Integer(25)).unwrap(), Value::Integer(55));
        assert_eq!(Value::Null.checked_add(&Value::Float(1.5)).unwrap(), Value::Float(1.5));
        assert!(Value::from("x").checked_add(&Value::Integer(1)).is_err());
    }

    #[test]
    fn test_order() {
        let mut values = vec![Value::from("a"), Value::Integer(2), Value::Null, Value::Float(1.5)];
        values.sort();
        assert_eq!(values, vec![Value::Null, Value::Float(1.5), Value::Integer(2), Value::from("a")]);
    }
}

// src/model/iop.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Value type of an input, output or parameter. Discriminants are the wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IopType {
    Integer = 1,
    Double = 2,
    String = 3,
    Bool = 4,
    Impulsion = 5,
    Data = 6,
}

impl IopType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(IopType::Integer),
            2 => Some(IopType::Double),
            3 => Some(IopType::String),
            4 => Some(IopType::Bool),
            5 => Some(IopType::Impulsion),
            6 => Some(IopType::Data),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IopType::Integer => "INTEGER",
            IopType::Double => "DOUBLE",
            IopType::String => "STRING",
            IopType::Bool => "BOOL",
            IopType::Impulsion => "IMPULSION",
            IopType::Data => "DATA",
        }
    }

    fn is_numeric(self) -> bool {
        matches!(self, IopType::Integer | IopType::Double | IopType::Bool)
    }

    /// Whether an output of type `output` may feed an input of type `self`.
    pub fn accepts(self, output: IopType) -> bool {
        if self == output || self == IopType::Impulsion {
            return true;
        }
        match self {
            IopType::Integer | IopType::Double | IopType::Bool => {
                output.is_numeric() || output == IopType::String
            }
            IopType::String => output.is_numeric(),
            IopType::Impulsion => true,
            IopType::Data => false,
        }
    }
}

impl fmt::Display for IopType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IopType {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" => Ok(IopType::Integer),
            "DOUBLE" => Ok(IopType::Double),
            "STRING" => Ok(IopType::String),
            "BOOL" | "BOOLEAN" => Ok(IopType::Bool),
            "IMPULSION" => Ok(IopType::Impulsion),
            "DATA" => Ok(IopType::Data),
            _ => Err(ModelError::UnknownType(s.to_string())),
        }
    }
}

/// Which table of a definition an IOP lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IopKind {
    Input,
    Output,
    Parameter,
}

impl IopKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IopKind::Input => "input",
            IopKind::Output => "output",
            IopKind::Parameter => "parameter",
        }
    }
}

/// Current value of an IOP, tagged by type.
#[derive(Debug, Clone, PartialEq)]
pub enum IopValue {
    Integer(i32),
    Double(f64),
    String(String),
    Bool(bool),
    Impulsion,
    Data(Vec<u8>),
}

impl IopValue {
    pub fn default_for(t: IopType) -> Self {
        match t {
            IopType::Integer => IopValue::Integer(0),
            IopType::Double => IopValue::Double(0.0),
            IopType::String => IopValue::String(String::new()),
            IopType::Bool => IopValue::Bool(false),
            IopType::Impulsion => IopValue::Impulsion,
            IopType::Data => IopValue::Data(Vec::new()),
        }
    }

    pub fn iop_type(&self) -> IopType {
        match self {
            IopValue::Integer(_) => IopType::Integer,
            IopValue::Double(_) => IopType::Double,
            IopValue::String(_) => IopType::String,
            IopValue::Bool(_) => IopType::Bool,
            IopValue::Impulsion => IopType::Impulsion,
            IopValue::Data(_) => IopType::Data,
        }
    }

    /// Convert to `target`, following the implicit conversion rules between IOP types.
    pub fn convert_to(&self, target: IopType) -> Result<IopValue, ModelError> {
        let from = self.iop_type();
        if from == target {
            return Ok(self.clone());
        }
        let fail = |detail: String| ModelError::Conversion {
            from,
            to: target,
            detail,
        };
        let converted = match (self, target) {
            (_, IopType::Impulsion) => IopValue::Impulsion,
            (IopValue::Integer(i), IopType::Double) => IopValue::Double(*i as f64),
            (IopValue::Integer(i), IopType::Bool) => IopValue::Bool(*i != 0),
            (IopValue::Double(d), IopType::Integer) => IopValue::Integer(*d as i32),
            (IopValue::Double(d), IopType::Bool) => IopValue::Bool(*d != 0.0),
            (IopValue::Bool(b), IopType::Integer) => IopValue::Integer(i32::from(*b)),
            (IopValue::Bool(b), IopType::Double) => IopValue::Double(if *b { 1.0 } else { 0.0 }),
            (IopValue::Data(bytes), IopType::String) => IopValue::String(
                String::from_utf8(bytes.clone()).map_err(|e| fail(e.to_string()))?,
            ),
            (IopValue::Data(_), _) => return Err(fail("data only converts to data".into())),
            (IopValue::String(s), IopType::Data) => IopValue::Data(s.as_bytes().to_vec()),
            (IopValue::String(s), IopType::Integer) => IopValue::Integer(
                s.trim()
                    .parse::<i32>()
                    .or_else(|_| s.trim().parse::<f64>().map(|d| d as i32))
                    .map_err(|e| fail(e.to_string()))?,
            ),
            (IopValue::String(s), IopType::Double) => {
                IopValue::Double(s.trim().parse::<f64>().map_err(|e| fail(e.to_string()))?)
            }
            (IopValue::String(s), IopType::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => IopValue::Bool(true),
                "false" | "0" => IopValue::Bool(false),
                other => return Err(fail(format!("'{}' is not a boolean", other))),
            },
            (IopValue::Impulsion, _) => IopValue::default_for(target),
            (_, IopType::String) => IopValue::String(self.to_string()),
            (_, IopType::Data) => return Err(fail("only string or data convert to data".into())),
            _ => return Err(fail("unsupported conversion".into())),
        };
        Ok(converted)
    }

    /// Raw value bytes as carried in the third frame of a data message.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        match self {
            IopValue::Integer(i) => i.to_le_bytes().to_vec(),
            IopValue::Double(d) => d.to_le_bytes().to_vec(),
            IopValue::String(s) => s.as_bytes().to_vec(),
            IopValue::Bool(b) => vec![u8::from(*b)],
            IopValue::Impulsion => Vec::new(),
            IopValue::Data(d) => d.clone(),
        }
    }

    pub fn from_wire_bytes(t: IopType, bytes: &[u8]) -> Result<IopValue, ModelError> {
        let invalid = |detail: &str| ModelError::InvalidValue {
            name: t.to_string(),
            detail: detail.to_string(),
        };
        Ok(match t {
            IopType::Integer => {
                let raw: [u8; 4] = bytes.try_into().map_err(|_| invalid("expected 4 bytes"))?;
                IopValue::Integer(i32::from_le_bytes(raw))
            }
            IopType::Double => {
                let raw: [u8; 8] = bytes.try_into().map_err(|_| invalid("expected 8 bytes"))?;
                IopValue::Double(f64::from_le_bytes(raw))
            }
            IopType::String => IopValue::String(
                String::from_utf8(bytes.to_vec()).map_err(|_| invalid("not UTF-8"))?,
            ),
            IopType::Bool => match bytes {
                [b] => IopValue::Bool(*b != 0),
                _ => return Err(invalid("expected 1 byte")),
            },
            IopType::Impulsion => IopValue::Impulsion,
            IopType::Data => IopValue::Data(bytes.to_vec()),
        })
    }

    /// Parse a textual value (as used by `SET_*` commands) into a value of type `t`.
    pub fn parse_text(t: IopType, text: &str) -> Result<IopValue, ModelError> {
        match t {
            IopType::Data => hex::decode(text.trim())
                .map(IopValue::Data)
                .map_err(|e| ModelError::InvalidValue {
                    name: t.to_string(),
                    detail: e.to_string(),
                }),
            _ => IopValue::String(text.to_string()).convert_to(t),
        }
    }

    pub(crate) fn to_json(&self) -> Option<serde_json::Value> {
        use serde_json::Value;
        match self {
            IopValue::Integer(i) => Some(Value::from(*i)),
            IopValue::Double(d) => Some(Value::from(*d)),
            IopValue::String(s) => Some(Value::from(s.clone())),
            IopValue::Bool(b) => Some(Value::from(*b)),
            IopValue::Impulsion => None,
            IopValue::Data(d) => Some(Value::from(hex::encode(d))),
        }
    }

    pub(crate) fn from_json(t: IopType, value: &serde_json::Value) -> Result<IopValue, ModelError> {
        use serde_json::Value;
        let invalid = || ModelError::InvalidValue {
            name: t.to_string(),
            detail: format!("unexpected JSON value {}", value),
        };
        match (t, value) {
            (_, Value::Null) | (IopType::Impulsion, _) => Ok(IopValue::default_for(t)),
            (IopType::Integer, Value::Number(n)) => n
                .as_i64()
                .map(|i| IopValue::Integer(i as i32))
                .or_else(|| n.as_f64().map(|d| IopValue::Integer(d as i32)))
                .ok_or_else(invalid),
            (IopType::Double, Value::Number(n)) => {
                n.as_f64().map(IopValue::Double).ok_or_else(invalid)
            }
            (IopType::Bool, Value::Bool(b)) => Ok(IopValue::Bool(*b)),
            (IopType::Bool, Value::Number(n)) => Ok(IopValue::Bool(n.as_f64() != Some(0.0))),
            (IopType::String, Value::String(s)) => Ok(IopValue::String(s.clone())),
            (IopType::Data, Value::String(s)) => IopValue::parse_text(t, s),
            (_, Value::String(s)) => IopValue::String(s.clone()).convert_to(t),
            (IopType::String, other) => Ok(IopValue::String(other.to_string())),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for IopValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IopValue::Integer(i) => write!(f, "{}", i),
            IopValue::Double(d) => write!(f, "{}", d),
            IopValue::String(s) => f.write_str(s),
            IopValue::Bool(b) => write!(f, "{}", b),
            IopValue::Impulsion => Ok(()),
            IopValue::Data(d) => f.write_str(&hex::encode(d)),
        }
    }
}

impl From<i32> for IopValue {
    fn from(v: i32) -> Self {
        IopValue::Integer(v)
    }
}

impl From<f64> for IopValue {
    fn from(v: f64) -> Self {
        IopValue::Double(v)
    }
}

impl From<bool> for IopValue {
    fn from(v: bool) -> Self {
        IopValue::Bool(v)
    }
}

impl From<&str> for IopValue {
    fn from(v: &str) -> Self {
        IopValue::String(v.to_string())
    }
}

impl From<String> for IopValue {
    fn from(v: String) -> Self {
        IopValue::String(v)
    }
}

impl From<Vec<u8>> for IopValue {
    fn from(v: Vec<u8>) -> Self {
        IopValue::Data(v)
    }
}

/// A named, typed value slot of a definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Iop {
    pub name: String,
    pub iop_type: IopType,
    pub value: IopValue,
    /// Only meaningful for outputs.
    pub muted: bool,
}

impl Iop {
    pub fn new(name: impl Into<String>, iop_type: IopType) -> Self {
        Self {
            name: name.into(),
            iop_type,
            value: IopValue::default_for(iop_type),
            muted: false,
        }
    }

    pub fn with_value(mut self, value: IopValue) -> Result<Self, ModelError> {
        self.value = value.convert_to(self.iop_type)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversions() {
        assert_eq!(
            IopValue::Integer(3).convert_to(IopType::Double).unwrap(),
            IopValue::Double(3.0)
        );
        assert_eq!(
            IopValue::Double(2.9).convert_to(IopType::Integer).unwrap(),
            IopValue::Integer(2)
        );
        assert_eq!(
            IopValue::Bool(true).convert_to(IopType::Integer).unwrap(),
            IopValue::Integer(1)
        );
        assert_eq!(
            IopValue::Double(0.0).convert_to(IopType::Bool).unwrap(),
            IopValue::Bool(false)
        );
    }

    #[test]
    fn string_conversions() {
        assert_eq!(
            IopValue::from("21.5").convert_to(IopType::Double).unwrap(),
            IopValue::Double(21.5)
        );
        assert_eq!(
            IopValue::from(" 7 ").convert_to(IopType::Integer).unwrap(),
            IopValue::Integer(7)
        );
        assert_eq!(
            IopValue::from("TRUE").convert_to(IopType::Bool).unwrap(),
            IopValue::Bool(true)
        );
        assert!(IopValue::from("abc").convert_to(IopType::Double).is_err());
        assert_eq!(
            IopValue::Integer(42).convert_to(IopType::String).unwrap(),
            IopValue::from("42")
        );
    }

    #[test]
    fn data_only_converts_to_data_or_string() {
        let data = IopValue::Data(b"hi".to_vec());
        assert!(data.convert_to(IopType::Integer).is_err());
        assert_eq!(data.convert_to(IopType::String).unwrap(), IopValue::from("hi"));
        assert!(IopValue::Integer(1).convert_to(IopType::Data).is_err());
        assert_eq!(
            data.convert_to(IopType::Impulsion).unwrap(),
            IopValue::Impulsion
        );
    }

    #[test]
    fn wire_bytes_are_fixed_width_for_scalars() {
        assert_eq!(IopValue::Integer(-1).to_wire_bytes().len(), 4);
        assert_eq!(IopValue::Double(1.5).to_wire_bytes().len(), 8);
        assert_eq!(IopValue::Bool(true).to_wire_bytes(), vec![1]);
        assert!(IopValue::Impulsion.to_wire_bytes().is_empty());
        assert_eq!(
            IopValue::from_wire_bytes(IopType::Double, &21.5f64.to_le_bytes()).unwrap(),
            IopValue::Double(21.5)
        );
        assert!(IopValue::from_wire_bytes(IopType::Integer, &[1, 2]).is_err());
    }

    #[test]
    fn compatibility_table() {
        assert!(IopType::Double.accepts(IopType::Double));
        assert!(IopType::Double.accepts(IopType::Integer));
        assert!(IopType::Integer.accepts(IopType::String));
        assert!(IopType::String.accepts(IopType::Bool));
        assert!(IopType::Impulsion.accepts(IopType::Data));
        assert!(!IopType::Data.accepts(IopType::String));
        assert!(!IopType::Double.accepts(IopType::Data));
        assert!(!IopType::Double.accepts(IopType::Impulsion));
    }

    #[test]
    fn type_names_parse_case_insensitively() {
        assert_eq!("double".parse::<IopType>().unwrap(), IopType::Double);
        assert_eq!(IopType::from_tag(5), Some(IopType::Impulsion));
        assert!("float".parse::<IopType>().is_err());
    }
}

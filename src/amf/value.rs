//! AMF0 value model
//!
//! Object properties are kept in wire order so that command objects encode
//! byte-for-byte the same way every time.

/// Ordered list of object properties
pub type Properties = Vec<(String, AmfValue)>;

/// A decoded AMF0 value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmfValue {
    /// Null (0x05)
    #[default]
    Null,

    /// Undefined (0x06)
    Undefined,

    /// Boolean (0x01)
    Boolean(bool),

    /// IEEE 754 double (0x00)
    Number(f64),

    /// UTF-8 string (0x02, or 0x0C when longer than 65535 bytes)
    String(String),

    /// Anonymous object (0x03)
    Object(Properties),

    /// Associative array (0x08), used by `onMetaData`
    EcmaArray(Properties),

    /// Dense array (0x0A)
    StrictArray(Vec<AmfValue>),

    /// Milliseconds since the Unix epoch (0x0B)
    Date(f64),
}

impl AmfValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AmfValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AmfValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Properties of an object or ECMA array
    pub fn as_properties(&self) -> Option<&Properties> {
        match self {
            AmfValue::Object(p) | AmfValue::EcmaArray(p) => Some(p),
            _ => None,
        }
    }

    pub fn is_null_or_undefined(&self) -> bool {
        matches!(self, AmfValue::Null | AmfValue::Undefined)
    }

    /// Look up a property; the first occurrence wins
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        self.as_properties()?
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn get_string(&self, key: &str) -> Option<&str> {
        self.get(key)?.as_str()
    }

    pub fn get_number(&self, key: &str) -> Option<f64> {
        self.get(key)?.as_number()
    }
}

impl From<bool> for AmfValue {
    fn from(v: bool) -> Self {
        AmfValue::Boolean(v)
    }
}

impl From<f64> for AmfValue {
    fn from(v: f64) -> Self {
        AmfValue::Number(v)
    }
}

impl From<u32> for AmfValue {
    fn from(v: u32) -> Self {
        AmfValue::Number(v as f64)
    }
}

impl From<&str> for AmfValue {
    fn from(v: &str) -> Self {
        AmfValue::String(v.to_string())
    }
}

impl From<String> for AmfValue {
    fn from(v: String) -> Self {
        AmfValue::String(v)
    }
}

/// Build an ordered AMF0 object from `key => value` pairs
#[macro_export]
macro_rules! amf_object {
    ($($key:expr => $value:expr),* $(,)?) => {
        $crate::amf::AmfValue::Object(vec![
            $(($key.to_string(), $crate::amf::AmfValue::from($value))),*
        ])
    };
}

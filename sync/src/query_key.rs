use std::fmt;

/// A single primitive component of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    /// Absent parameter.
    Null,
    /// Boolean parameter.
    Bool(bool),
    /// Integer parameter (ids, page numbers).
    Int(i64),
    /// String parameter (resource names, search terms).
    Str(String),
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        KeyPart::Str(value.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        KeyPart::Str(value)
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        KeyPart::Str(value.clone())
    }
}

impl From<bool> for KeyPart {
    fn from(value: bool) -> Self {
        KeyPart::Bool(value)
    }
}

macro_rules! int_key_part {
    ($($t:ty),*) => {
        $(
            impl From<$t> for KeyPart {
                fn from(value: $t) -> Self {
                    KeyPart::Int(i64::from(value))
                }
            }
        )*
    };
}

int_key_part!(i8, i16, i32, i64, u8, u16, u32);

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
    fn from(value: Option<T>) -> Self {
        value.map_or(KeyPart::Null, Into::into)
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPart::Null => write!(f, "null"),
            KeyPart::Bool(b) => write!(f, "{b}"),
            KeyPart::Int(i) => write!(f, "{i}"),
            KeyPart::Str(s) => write!(f, "{s:?}"),
        }
    }
}

/// Identity of a cacheable request: a resource name followed by its
/// parameters, e.g. `["courses", 5, "rust"]`.
///
/// Equality and hashing are structural, so two keys built independently from
/// the same values address the same cache entry.
///
/// ```
/// use catalog_sync::{query_key, QueryKey};
///
/// let a = QueryKey::new("courses").with(5).with("rust");
/// let b = query_key!["courses", 5, "rust"];
/// assert_eq!(a, b);
/// assert!(a.starts_with(&query_key!["courses"]));
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
    /// A key for `resource` with no parameters.
    pub fn new(resource: impl Into<String>) -> Self {
        QueryKey(vec![KeyPart::Str(resource.into())])
    }

    /// Builds a key from raw parts.
    pub fn from_parts(parts: Vec<KeyPart>) -> Self {
        QueryKey(parts)
    }

    /// Appends a parameter.
    pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
        self.0.push(part.into());
        self
    }

    /// The resource name, if the first part is a string.
    pub fn resource(&self) -> Option<&str> {
        match self.0.first() {
            Some(KeyPart::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// All parts in order.
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    /// Whether `prefix` matches the leading parts of this key.
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{part}")?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey{self}")
    }
}

/// Builds a [`QueryKey`] from a list of values convertible into [`KeyPart`].
#[macro_export]
macro_rules! query_key {
    ($($part:expr),+ $(,)?) => {
        $crate::QueryKey::from_parts(vec![$($crate::KeyPart::from($part)),+])
    };
}

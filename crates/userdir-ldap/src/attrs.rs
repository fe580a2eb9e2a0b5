//! Attribute value conversion between text and wire bytes.
//!
//! Reads are best-effort: a value that does not decode as UTF-8 stays in
//! its raw byte form without failing the record. Writes honor the
//! `;binary` attribute name suffix and the `[""]` empty-value convention
//! meaning "omit this attribute entirely".

/// Attribute names whose values are never decoded to text.
///
/// Membership is case-insensitive.
pub const BINARY_ATTRIBUTES: &[&str] = &[
    "audio",
    "cacertificate",
    "jpegphoto",
    "krbextradata",
    "objectguid",
    "objectsid",
    "photo",
    "usercertificate",
];

/// Marker suffix on attribute names that forces raw byte transmission.
pub(crate) const BINARY_SUFFIX: &str = ";binary";

/// Returns true if the attribute is in the fixed binary-attribute set.
#[must_use]
pub fn is_binary_attribute(name: &str) -> bool {
    BINARY_ATTRIBUTES
        .iter()
        .any(|known| name.eq_ignore_ascii_case(known))
}

/// A single attribute value, decoded when possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// Value decoded to text
    Text(String),
    /// Raw wire bytes, either from a binary attribute or a value that
    /// failed to decode
    Bytes(Vec<u8>),
}

impl AttrValue {
    /// Returns the text form, if this value decoded.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text.as_str()),
            Self::Bytes(_) => None,
        }
    }

    /// Returns the wire byte form of the value.
    #[must_use]
    pub fn to_wire(&self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.clone().into_bytes(),
            Self::Bytes(bytes) => bytes.clone(),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// Attribute values supplied to a write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrInput {
    /// A single string; split on `;` into multiple values for non-binary
    /// attributes (a multi-value convenience, not an escaping mechanism)
    Single(String),
    /// Explicit list of text values
    Multi(Vec<String>),
    /// Raw byte values, transmitted unmodified
    Binary(Vec<Vec<u8>>),
}

impl AttrInput {
    /// Returns true if this input should be treated as raw bytes.
    #[must_use]
    pub const fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Normalizes the input to a value list without the `;` split,
    /// as modify expects explicit lists.
    #[must_use]
    pub fn to_values(&self) -> Vec<AttrValue> {
        match self {
            Self::Single(text) => vec![AttrValue::Text(text.clone())],
            Self::Multi(values) => values
                .iter()
                .map(|value| AttrValue::Text(value.clone()))
                .collect(),
            Self::Binary(values) => values
                .iter()
                .map(|value| AttrValue::Bytes(value.clone()))
                .collect(),
        }
    }
}

impl From<&str> for AttrInput {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<Vec<String>> for AttrInput {
    fn from(values: Vec<String>) -> Self {
        Self::Multi(values)
    }
}

/// Decodes raw wire values for one attribute.
///
/// Binary-set attributes keep their bytes. Everything else is decoded to
/// text per value; a value that fails to decode is left raw and the rest
/// of the record is unaffected.
#[must_use]
pub fn decode_values(name: &str, raw: Vec<Vec<u8>>) -> Vec<AttrValue> {
    let binary = is_binary_attribute(name);
    raw.into_iter()
        .map(|bytes| {
            if binary {
                AttrValue::Bytes(bytes)
            } else {
                match String::from_utf8(bytes) {
                    Ok(text) => AttrValue::Text(text),
                    Err(err) => AttrValue::Bytes(err.into_bytes()),
                }
            }
        })
        .collect()
}

/// Encodes one attribute for an insert.
///
/// Returns the transmission name and wire values, or `None` when the
/// attribute resolves to the empty placeholder and must be omitted.
#[must_use]
pub(crate) fn encode_for_insert(name: &str, input: &AttrInput) -> Option<(String, Vec<Vec<u8>>)> {
    let (name, marked_binary) = split_binary_marker(name);
    let binary = marked_binary || input.is_binary();

    let values: Vec<Vec<u8>> = match input {
        AttrInput::Binary(values) => values.clone(),
        AttrInput::Single(text) if !binary => {
            let parts: Vec<&str> = text.split(';').map(str::trim).collect();
            if parts == [""] {
                return None;
            }
            parts.into_iter().map(|part| part.as_bytes().to_vec()).collect()
        }
        AttrInput::Single(text) => vec![text.clone().into_bytes()],
        AttrInput::Multi(values) => {
            if values.len() == 1 && values[0].is_empty() {
                return None;
            }
            values.iter().map(|value| value.clone().into_bytes()).collect()
        }
    };

    Some((name.to_string(), values))
}

/// Splits the `;binary` marker off an attribute name.
pub(crate) fn split_binary_marker(name: &str) -> (&str, bool) {
    name.strip_suffix(BINARY_SUFFIX)
        .map_or((name, false), |stripped| (stripped, true))
}

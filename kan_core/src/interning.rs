//! Process-wide string interning.
//!
//! Interned strings are deduplicated into leaked payloads, so the handle is a
//! thin `Copy` pointer and equality is pointer identity. All name lookups in
//! the reflection registry and the universe repositories rely on this.

use fxhash::FxHashMap;
use parking_lot::Mutex;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::OnceLock;

struct InternedPayload {
    text: Box<str>,
}

static INTERNER: OnceLock<Mutex<FxHashMap<&'static str, &'static InternedPayload>>> =
    OnceLock::new();

/// Handle to a deduplicated string. Equality, hashing and ordering are all by
/// payload address, never by content.
#[derive(Clone, Copy)]
pub struct InternedString(&'static InternedPayload);

/// Shorthand for `InternedString::new`.
pub fn intern(text: &str) -> InternedString {
    InternedString::new(text)
}

impl InternedString {
    pub fn new(text: &str) -> Self {
        let interner = INTERNER.get_or_init(|| Mutex::new(FxHashMap::default()));
        let mut map = interner.lock();

        if let Some(existing) = map.get(text) {
            return InternedString(*existing);
        }

        let payload: &'static InternedPayload = Box::leak(Box::new(InternedPayload {
            text: text.into(),
        }));
        let key: &'static str = &payload.text;
        map.insert(key, payload);
        InternedString(payload)
    }

    pub fn as_str(&self) -> &'static str {
        &self.0.text
    }

    pub fn is_empty(&self) -> bool {
        self.0.text.is_empty()
    }

    fn address(&self) -> usize {
        self.0 as *const InternedPayload as usize
    }
}

impl Default for InternedString {
    fn default() -> Self {
        InternedString::new("")
    }
}

impl PartialEq for InternedString {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for InternedString {}

impl Hash for InternedString {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

impl PartialOrd for InternedString {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InternedString {
    fn cmp(&self, other: &Self) -> Ordering {
        self.address().cmp(&other.address())
    }
}

impl fmt::Display for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for InternedString {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl Serialize for InternedString {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

struct InternedStringVisitor;

impl<'de> Visitor<'de> for InternedStringVisitor {
    type Value = InternedString;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        formatter.write_str("a string")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<InternedString, E> {
        Ok(InternedString::new(value))
    }
}

impl<'de> Deserialize<'de> for InternedString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(InternedStringVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_same_content_same_handle() {
        let a = intern("material");
        let b = intern(&format!("mat{}", "erial"));
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "material");
    }

    #[test]
    fn intern_distinct_content_distinct_handles() {
        assert_ne!(intern("mesh"), intern("texture"));
    }

    #[test]
    fn serde_round_trip_preserves_identity() {
        let original = intern("effect");
        let json = serde_json::to_string(&original).unwrap();
        let restored: InternedString = serde_json::from_str(&json).unwrap();
        assert_eq!(original, restored);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Free-form tags carried by most entities

use horde_common::api::external::Error;
use std::collections::BTreeMap;

/// A string-to-string map with case-insensitive keys
///
/// Keys are folded to lower case and values are trimmed on the way in.  An
/// empty value means the tag is absent: setting it removes the key, and
/// reading a missing key yields the empty string.  Stored as a JSON object.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Tags(BTreeMap<String, String>);

impl Tags {
    pub fn new() -> Tags {
        Tags::default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        let key = key.to_lowercase();
        let value = value.trim();
        if value.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value.to_owned());
        }
    }

    pub fn get(&self, key: &str) -> &str {
        self.0.get(&key.to_lowercase()).map(String::as_str).unwrap_or("")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Serialises the tags for a JSON column.
    pub fn to_json(&self) -> String {
        // A map of strings always serialises.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Parses a JSON column value, normalising keys and values.
    pub fn from_json(s: &str) -> Result<Tags, Error> {
        let map: BTreeMap<String, String> =
            serde_json::from_str(s).map_err(|e| {
                Error::internal_error(&format!("malformed tags: {}", e))
            })?;
        Ok(map.iter().collect())
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Tags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut tags = Tags::new();
        for (k, v) in iter {
            tags.set(k.as_ref(), v.as_ref());
        }
        tags
    }
}

#[cfg(test)]
mod test {
    use super::Tags;

    #[test]
    fn test_set_get() {
        let mut tags = Tags::new();
        tags.set("Name", "  sensor 1 ");
        assert_eq!(tags.get("name"), "sensor 1");
        assert_eq!(tags.get("NAME"), "sensor 1");
        assert_eq!(tags.get("missing"), "");

        tags.set("NAME", "");
        assert_eq!(tags.get("name"), "");
        assert!(tags.is_empty());

        tags.set("a", "   ");
        assert!(tags.is_empty());
    }

    #[test]
    fn test_json() {
        let tags: Tags = [("Location", "roof "), ("b", "2")].into_iter().collect();
        let json = tags.to_json();
        assert_eq!(json, r#"{"b":"2","location":"roof"}"#);
        assert_eq!(Tags::from_json(&json).unwrap(), tags);

        // Stored values written by other tools are normalised on load.
        let loaded = Tags::from_json(r#"{"KEY":" v ","empty":""}"#).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get("key"), "v");

        assert!(Tags::from_json("[1, 2]").is_err());
    }
}

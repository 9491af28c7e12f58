//! Field name escaping for MongoDB compatibility.
//!
//! MongoDB restricts field names (document keys) from containing dots and dollar signs,
//! which are query syntax, and null bytes. Record bodies are arbitrary JSON, so their keys
//! are escaped before storage and restored on read. Values are stored untouched.

use bson::Bson;

/// Escapes and restores keys of BSON documents, recursively.
///
/// Escapes are `%` followed by two hex digits, and `%` itself is escaped, so restoring
/// always gives back the original key.
pub(crate) struct KeySanitizer;

impl KeySanitizer {
    /// Character replacements, the escape character first.
    const REPLACEMENTS: [(&'static str, &'static str); 4] = [
        ("%", "%25"),
        (".", "%2E"),
        ("$", "%24"),
        ("\0", "%00"),
    ];

    /// Escapes every key of every document nested in `value`.
    pub(crate) fn sanitize_value(value: &Bson) -> Bson {
        match value {
            Bson::Array(arr) => Bson::Array(
                arr
                    .iter()
                    .map(Self::sanitize_value)
                    .collect(),
            ),
            Bson::Document(doc) => Bson::Document(
                doc.iter()
                    .map(|(k, v)| (Self::sanitize_key(k), Self::sanitize_value(v)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    pub(crate) fn sanitize_key(input: &str) -> String {
        let mut sanitized = input.to_string();
        for (target, replacement) in Self::REPLACEMENTS.iter() {
            sanitized = sanitized.replace(*target, *replacement);
        }
        sanitized
    }

    /// Inverse of [`sanitize_value`](Self::sanitize_value).
    pub(crate) fn restore_value(value: &Bson) -> Bson {
        match value {
            Bson::Array(arr) => Bson::Array(
                arr
                    .iter()
                    .map(Self::restore_value)
                    .collect(),
            ),
            Bson::Document(doc) => Bson::Document(
                doc.iter()
                    .map(|(k, v)| (Self::restore_key(k), Self::restore_value(v)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }

    pub(crate) fn restore_key(input: &str) -> String {
        let mut restored = input.to_string();
        for (target, replacement) in Self::REPLACEMENTS.iter().rev() {
            restored = restored.replace(*replacement, *target);
        }
        restored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn escapes_keys_but_not_values() {
        let value = Bson::Document(doc! {
            "a.b": "x.y",
            "$set": [{ "100%": 1 }],
        });

        let sanitized = KeySanitizer::sanitize_value(&value);

        assert_eq!(
            sanitized,
            Bson::Document(doc! {
                "a%2Eb": "x.y",
                "%24set": [{ "100%25": 1 }],
            })
        );
        assert_eq!(KeySanitizer::restore_value(&sanitized), value);
    }

    #[test]
    fn escaped_looking_keys_survive() {
        for key in ["%2E", "%252E", "a%", "plain"] {
            assert_eq!(KeySanitizer::restore_key(&KeySanitizer::sanitize_key(key)), key);
        }
    }
}

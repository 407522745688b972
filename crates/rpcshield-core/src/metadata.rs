//! Minimal view of RPC call metadata (headers / invocation metadata).

use std::collections::HashMap;

/// Metadata key carrying the caller's identity for rate limiting.
pub const CLIENT_ID_KEY: &str = "x-client-id";

/// Metadata key carrying the correlation id between services.
pub const CORRELATION_ID_KEY: &str = "x-correlation-id";

/// Key/value metadata attached to an RPC call.
///
/// Keys compare ASCII case-insensitively in every implementation.
/// Implemented for the shapes transports commonly hand out; wrap anything
/// else in a newtype.
pub trait Metadata {
    /// First value for `key`, if any.
    fn get(&self, key: &str) -> Option<&str>;

    /// Set `key` to `value`, replacing existing values.
    fn set(&mut self, key: &str, value: String);
}

impl Metadata for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key)
            .or_else(|| {
                self.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(key))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    fn set(&mut self, key: &str, value: String) {
        self.retain(|k, _| !k.eq_ignore_ascii_case(key));
        self.insert(key.to_string(), value);
    }
}

impl Metadata for Vec<(String, String)> {
    fn get(&self, key: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        self.push((key.to_string(), value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec_metadata_replaces_case_insensitively() {
        let mut md: Vec<(String, String)> = vec![("X-Correlation-Id".into(), "old".into())];
        md.set(CORRELATION_ID_KEY, "new".into());
        assert_eq!(md.len(), 1);
        assert_eq!(Metadata::get(&md, "x-correlation-id"), Some("new"));
    }

    #[test]
    fn map_and_vec_agree_on_mixed_case_keys() {
        let mut map: HashMap<String, String> =
            HashMap::from([("X-Client-Id".to_string(), "acme".to_string())]);
        let vec: Vec<(String, String)> = vec![("X-Client-Id".into(), "acme".into())];
        assert_eq!(Metadata::get(&map, CLIENT_ID_KEY), Some("acme"));
        assert_eq!(Metadata::get(&vec, CLIENT_ID_KEY), Some("acme"));

        map.set(CLIENT_ID_KEY, "other".into());
        assert_eq!(map.len(), 1);
        assert_eq!(Metadata::get(&map, "X-CLIENT-ID"), Some("other"));
    }

    #[test]
    fn map_metadata() {
        let mut md: HashMap<String, String> = HashMap::new();
        assert_eq!(Metadata::get(&md, CLIENT_ID_KEY), None);
        md.set(CLIENT_ID_KEY, "acme".into());
        assert_eq!(Metadata::get(&md, CLIENT_ID_KEY), Some("acme"));
    }
}

/// Case-insensitive, order-preserving header storage.
///
/// Stored as a flat `Vec` rather than a `HashMap` because pipelined
/// requests are small (tens of headers) and the access pattern is
/// "iterate once while building the wire bytes", which a `Vec` serves
/// with less overhead than hashing every name. Multi-valued headers are
/// represented by repeated `(name, value)` pairs, matching spec §4.3's
/// "multi-valued headers repeat the name" serialization rule.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        Self { entries: Vec::with_capacity(cap) }
    }

    /// Insert a header, lower-casing the name (spec §4.1: "lowercased name").
    pub fn push(&mut self, name: &str, value: &str) {
        self.entries.push((name.to_ascii_lowercase(), value.to_string()));
    }

    /// First value for `name`, case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.entries.iter().find(|(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> {
        let name = name.to_ascii_lowercase();
        self.entries.iter().filter(move |(k, _)| *k == name).map(|(_, v)| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Remove every value for `name`; returns how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let name = name.to_ascii_lowercase();
        let before = self.entries.len();
        self.entries.retain(|(k, _)| *k != name);
        before - self.entries.len()
    }

    /// Replace all values for `name` with a single value, appending if absent.
    pub fn set(&mut self, name: &str, value: &str) {
        self.remove(name);
        self.push(name, value);
    }

    /// Append a value to an existing header, or insert it if absent
    /// (spec §6: "appended rather than replaced when already present").
    pub fn append_or_set(&mut self, name: &str, value: &str) {
        let lower = name.to_ascii_lowercase();
        if let Some((_, existing)) = self.entries.iter_mut().find(|(k, _)| *k == lower) {
            existing.push_str(", ");
            existing.push_str(value);
        } else {
            self.entries.push((lower, value.to_string()));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_on_insert() {
        let mut h = HeaderMap::new();
        h.push("Content-Type", "text/plain");
        assert_eq!(h.get("content-type"), Some("text/plain"));
        assert_eq!(h.iter().next().unwrap().0, "content-type");
    }

    #[test]
    fn get_is_case_insensitive() {
        let mut h = HeaderMap::new();
        h.push("X-Forwarded-For", "1.2.3.4");
        assert_eq!(h.get("x-forwarded-for"), Some("1.2.3.4"));
        assert_eq!(h.get("X-FORWARDED-FOR"), Some("1.2.3.4"));
    }

    #[test]
    fn multi_valued_headers_repeat_name() {
        let mut h = HeaderMap::new();
        h.push("set-cookie", "a=1");
        h.push("set-cookie", "b=2");
        let values: Vec<_> = h.get_all("set-cookie").collect();
        assert_eq!(values, vec!["a=1", "b=2"]);
    }

    #[test]
    fn remove_clears_all_values() {
        let mut h = HeaderMap::new();
        h.push("set-cookie", "a=1");
        h.push("set-cookie", "b=2");
        assert_eq!(h.remove("set-cookie"), 2);
        assert!(!h.contains("set-cookie"));
    }

    #[test]
    fn append_or_set_appends_when_present() {
        let mut h = HeaderMap::new();
        h.push("x-forwarded-for", "1.2.3.4");
        h.append_or_set("x-forwarded-for", "5.6.7.8");
        assert_eq!(h.get("x-forwarded-for"), Some("1.2.3.4, 5.6.7.8"));
    }

    #[test]
    fn append_or_set_inserts_when_absent() {
        let mut h = HeaderMap::new();
        h.append_or_set("x-forwarded-host", "example.com");
        assert_eq!(h.get("x-forwarded-host"), Some("example.com"));
    }

    #[test]
    fn set_replaces_existing_values() {
        let mut h = HeaderMap::new();
        h.push("content-length", "10");
        h.set("content-length", "20");
        assert_eq!(h.get_all("content-length").count(), 1);
        assert_eq!(h.get("content-length"), Some("20"));
    }
}

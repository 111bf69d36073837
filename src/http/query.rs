//! Query string and cookie header parser with flexible collection support.

use memchr::memchr;
use std::{borrow::Cow, collections::HashMap};

/// Parser for `key=value` lists: URL query strings, form bodies and `Cookie`
/// headers.
///
/// Keys and values are percent-decoded. Invalid UTF-8 produced by decoding is
/// replaced with `U+FFFD`. Collecting into a [`HashMap`] keeps the last value
/// of a repeated key.
///
/// # Examples
/// ```rust
/// use kiln::query::Query;
/// use std::collections::HashMap;
///
/// // Parse into Vec (preserves order)
/// let params: Vec<(String, String)> = Query::parse("name=john&age=25&city");
/// assert_eq!(params.len(), 3);
/// assert_eq!(params[2], ("city".to_string(), String::new()));
///
/// // Parse into HashMap (last value wins)
/// let params: HashMap<String, String> = Query::parse("?key=1&key=2&q=a%20b+c");
/// assert_eq!(params["key"], "2");
/// assert_eq!(params["q"], "a b c");
/// ```
pub struct Query;

impl Query {
    /// Parses a query string (`a=1&b=2`, leading `?` optional).
    ///
    /// `+` is decoded as a space, as in `application/x-www-form-urlencoded`.
    #[inline]
    pub fn parse<C: QueryCollector>(query: &str) -> C {
        let mut result = C::default();
        let data = query.strip_prefix('?').unwrap_or(query);
        Self::parse_into(&mut result, data, b'&', true);
        result
    }

    /// Parses a `Cookie` header value (`a=1; b=2`).
    ///
    /// ```rust
    /// use kiln::query::Query;
    /// use std::collections::HashMap;
    ///
    /// let cookies: HashMap<String, String> = Query::parse_cookies("sid=abc; theme=dark");
    /// assert_eq!(cookies["sid"], "abc");
    /// assert_eq!(cookies["theme"], "dark");
    /// ```
    #[inline]
    pub fn parse_cookies<C: QueryCollector>(header: &str) -> C {
        let mut result = C::default();
        Self::parse_into(&mut result, header, b';', false);
        result
    }

    /// Appends the parameters found in `data` to an existing collection.
    ///
    /// Empty segments (`a=1&&b=2`) are skipped. A segment without `=` is a
    /// key with an empty value.
    pub fn parse_into<C: QueryCollector>(result: &mut C, data: &str, split: u8, form: bool) {
        let bytes = data.as_bytes();

        let mut start = 0;
        while start < bytes.len() {
            // Find next separator or end of string
            let end = memchr(split, &bytes[start..])
                .map(|pos| start + pos)
                .unwrap_or(bytes.len());

            let segment = data[start..end].trim();
            start = end + 1;
            if segment.is_empty() {
                continue;
            }

            let (key, value) = match memchr(b'=', segment.as_bytes()) {
                Some(index) => (&segment[..index], &segment[index + 1..]),
                None => (segment, ""),
            };

            result.add_param(decode(key, form), decode(value, form));
        }
    }
}

fn decode(raw: &str, form: bool) -> String {
    let raw = match form && raw.contains('+') {
        true => Cow::Owned(raw.replace('+', " ")),
        false => Cow::Borrowed(raw),
    };

    match urlencoding::decode(&raw) {
        Ok(value) => value.into_owned(),
        Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(raw.as_bytes())).into_owned(),
    }
}

/// A trait for types that can collect parsed parameters.
///
/// # Examples
/// ```rust
/// use kiln::query::{Query, QueryCollector};
///
/// #[derive(Default)]
/// struct KeysOnly(Vec<String>);
///
/// impl QueryCollector for KeysOnly {
///     fn add_param(&mut self, key: String, _value: String) {
///         self.0.push(key);
///     }
/// }
///
/// let keys: KeysOnly = Query::parse("a=1&b=2");
/// assert_eq!(keys.0, ["a", "b"]);
/// ```
pub trait QueryCollector: Default {
    /// Adds a decoded parameter to the collection.
    fn add_param(&mut self, key: String, value: String);
}

// Implementation for Vec - preserves parameter order
impl QueryCollector for Vec<(String, String)> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.push((key, value));
    }
}

// Implementation for HashMap - deduplicates parameters (last wins)
impl QueryCollector for HashMap<String, String> {
    #[inline(always)]
    fn add_param(&mut self, key: String, value: String) {
        self.insert(key, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(src: &str) -> Vec<(String, String)> {
        Query::parse(src)
    }

    #[test]
    fn basic() {
        for line in ["a=1&b=2", "?a=1&b=2"] {
            let params = pairs(line);

            assert_eq!(params.len(), 2);
            assert_eq!(params[0], ("a".into(), "1".into()));
            assert_eq!(params[1], ("b".into(), "2".into()));
        }
    }

    #[test]
    fn full() {
        let params = pairs("flag&empty=&=val&&key=value");

        assert_eq!(params.len(), 4);
        assert_eq!(params[0], ("flag".into(), "".into()));
        assert_eq!(params[1], ("empty".into(), "".into()));
        assert_eq!(params[2], ("".into(), "val".into()));
        assert_eq!(params[3], ("key".into(), "value".into()));
    }

    #[test]
    fn percent_decoding() {
        #[rustfmt::skip]
        let cases = [
            ("email=user%40example.com", "email", "user@example.com"),
            ("q=hello+world",            "q",     "hello world"),
            ("q=%E2%9C%93",              "q",     "\u{2713}"),
            ("q=%FF",                    "q",     "\u{FFFD}"),
            ("a%20b=c",                  "a b",   "c"),
        ];

        for (src, key, value) in cases {
            let map: HashMap<String, String> = Query::parse(src);
            assert_eq!(map.get(key).map(String::as_str), Some(value), "{src}");
        }
    }

    #[test]
    fn last_value_wins() {
        let map: HashMap<String, String> = Query::parse("id=1&id=2&id=3");
        assert_eq!(map.len(), 1);
        assert_eq!(map["id"], "3");
    }

    #[test]
    fn cookies() {
        let map: HashMap<String, String> = Query::parse_cookies("a=1;b=two words ;  c=x+y; a=4");
        assert_eq!(map["a"], "4");
        assert_eq!(map["b"], "two words");
        assert_eq!(map["c"], "x+y");
    }

    #[test]
    fn empty() {
        assert!(pairs("").is_empty());
        assert!(pairs("?").is_empty());
    }
}

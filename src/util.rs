use std::sync::Mutex;

use http::header::{HeaderName, HeaderValue};

use crate::error::Error;

const MAX_ERROR_BODY_LEN: usize = 2048;

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse().map_err(|source| Error::InvalidHeaderName {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value.parse().map_err(|source| Error::InvalidHeaderValue {
        name: name.to_owned(),
        source,
    })
}

pub(crate) fn append_query_pairs(url: &str, pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return url.to_owned();
    }

    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in pairs {
        serializer.append_pair(name, value);
    }
    let encoded = serializer.finish();

    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    match fragment {
        Some(fragment) => format!("{base}{separator}{encoded}#{fragment}"),
        None => format!("{base}{separator}{encoded}"),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}

#[cfg(test)]
mod tests {
    use super::{append_query_pairs, truncate_body};

    #[test]
    fn append_query_pairs_encodes_and_picks_the_separator() {
        let pairs = vec![("q".to_owned(), "a b".to_owned())];
        assert_eq!(
            append_query_pairs("https://example.com/search", &pairs),
            "https://example.com/search?q=a+b"
        );
        assert_eq!(
            append_query_pairs("https://example.com/search?page=2", &pairs),
            "https://example.com/search?page=2&q=a+b"
        );
        assert_eq!(append_query_pairs("https://example.com/", &[]), "https://example.com/");
    }

    #[test]
    fn truncate_body_keeps_short_bodies_intact() {
        assert_eq!(truncate_body(b"hello"), "hello");
    }

    #[test]
    fn truncate_body_marks_long_bodies() {
        let long = "x".repeat(5000);
        let truncated = truncate_body(long.as_bytes());
        assert!(truncated.ends_with("...(truncated)"));
        assert!(truncated.len() < long.len());
    }
}

//! URI utilities.

use camino::Utf8Path;
use http::Uri;

/// Extension trait for URIs.
pub trait UriExtension {
    /// Join a path to a URI, producing the text of the joined URI.
    ///
    /// The result is parsed when the request is built, so an invalid path surfaces
    /// as a request error rather than a panic.
    fn join<P: AsRef<str>>(&self, path: P) -> String;

    /// The `scheme://authority` prefix of the URI, if it has one.
    fn origin(&self) -> Option<String>;
}

impl UriExtension for Uri {
    fn join<P: AsRef<str>>(&self, path: P) -> String {
        let joined = Utf8Path::new(self.path()).join(path.as_ref());
        match self.origin() {
            Some(origin) => format!("{origin}{joined}"),
            None => joined.into_string(),
        }
    }

    fn origin(&self) -> Option<String> {
        match (self.scheme_str(), self.authority()) {
            (Some(scheme), Some(authority)) => Some(format!("{scheme}://{authority}")),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn test_uri_join() {
        let uri = "http://example.com".parse::<Uri>().unwrap();
        assert_eq!(uri.join("foo"), "http://example.com/foo");

        let uri = "http://example.com/".parse::<Uri>().unwrap();
        assert_eq!(uri.join("foo"), "http://example.com/foo");

        let uri = "http://example.com/bar".parse::<Uri>().unwrap();
        assert_eq!(uri.join("foo"), "http://example.com/bar/foo");

        let uri = "http://example.com/bar/".parse::<Uri>().unwrap();
        assert_eq!(uri.join("foo"), "http://example.com/bar/foo");

        let uri = "http://example.com/bar".parse::<Uri>().unwrap();
        assert_eq!(uri.join("/foo"), "http://example.com/foo");
    }

    #[test]
    fn test_uri_join_keeps_query() {
        let uri = "https://gcr.io/v2/".parse::<Uri>().unwrap();
        assert_eq!(
            uri.join("proj/app/tags/list?n=10"),
            "https://gcr.io/v2/proj/app/tags/list?n=10"
        );
    }
}

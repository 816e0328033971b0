//! Following paged listings.

use http::HeaderMap;

/// A trait for paginating responses from an API
pub trait PaginationInfo {
    /// Get the current page number, when the API reports one
    fn page(&self) -> Option<usize> {
        None
    }

    /// Where the next page of results lives, relative to the API root or absolute
    fn next(&self) -> Option<&str>;
}

/// Pagination advertised by a `Link: <...>; rel="next"` response header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkPagination {
    next: Option<String>,
}

impl LinkPagination {
    /// Read the `rel="next"` target from every `Link` header.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let next = headers
            .get_all(http::header::LINK)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(','))
            .find_map(next_target)
            .map(str::to_owned);
        Self { next }
    }
}

impl PaginationInfo for LinkPagination {
    fn next(&self) -> Option<&str> {
        self.next.as_deref()
    }
}

fn next_target(link: &str) -> Option<&str> {
    let (target, params) = link.trim().strip_prefix('<')?.split_once('>')?;
    params
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rel="))
        .any(|rel| {
            rel.trim_matches('"')
                .split_ascii_whitespace()
                .any(|rel| rel.eq_ignore_ascii_case("next"))
        })
        .then_some(target)
}

#[cfg(test)]
mod tests {
    use http::header::{HeaderValue, LINK};

    use super::*;

    #[test]
    fn finds_the_next_link() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_static(
                r#"</v2/app/tags/list?last=v0>; rel="prev", </v2/app/tags/list?last=v1&n=1>; rel="next""#,
            ),
        );
        let pages = LinkPagination::from_headers(&headers);
        assert_eq!(pages.next(), Some("/v2/app/tags/list?last=v1&n=1"));
        assert_eq!(pages.page(), None);
    }

    #[test]
    fn unquoted_and_missing_links() {
        let mut headers = HeaderMap::new();
        assert_eq!(LinkPagination::from_headers(&headers).next(), None);

        headers.insert(LINK, HeaderValue::from_static("</v2/_catalog?last=a>;rel=next"));
        assert_eq!(
            LinkPagination::from_headers(&headers).next(),
            Some("/v2/_catalog?last=a")
        );

        headers.insert(LINK, HeaderValue::from_static("</docs>; rel=\"help\""));
        assert_eq!(LinkPagination::from_headers(&headers).next(), None);
    }
}

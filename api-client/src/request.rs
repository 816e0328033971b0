use std::time::Duration;

use futures::TryStreamExt as _;
use http::{header::HeaderValue, HeaderName};
use serde::Serialize;

use crate::basic_auth;
use crate::{response::Response, ApiClient, Authentication, Error};

/// Extensions for outgoing requests.
pub trait RequestExt {
    /// Set a `Basic` authorization header.
    fn basic_auth<U, P>(self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display;

    /// A copy of the request head, without the body.
    fn parts(&self) -> http::request::Parts;
}

impl<B> RequestExt for http::Request<B> {
    fn basic_auth<U, P>(mut self, username: U, password: Option<P>) -> Self
    where
        U: std::fmt::Display,
        P: std::fmt::Display,
    {
        let hrds = self.headers_mut();
        hrds.append(http::header::AUTHORIZATION, basic_auth(username, password));

        self
    }

    fn parts(&self) -> http::request::Parts {
        let (mut parts, _) = http::Request::new(()).into_parts();
        parts.method = self.method().clone();
        parts.uri = self.uri().clone();
        parts.version = self.version();
        parts.headers = self.headers().clone();
        parts
    }
}

/// A request under construction, bound to the client which will send it.
#[derive(Debug)]
pub struct RequestBuilder<A> {
    req: http::request::Builder,
    uri: String,
    client: ApiClient<A>,
    body: Option<hyperdriver::Body>,
    timeout: Option<Duration>,
    error: Option<Error>,
}

impl<A> RequestBuilder<A> {
    /// Start a request for `uri`.
    pub fn new(client: ApiClient<A>, uri: String, method: http::Method) -> Self {
        Self {
            req: http::Request::builder().method(method),
            uri,
            client,
            body: None,
            timeout: None,
            error: None,
        }
    }

    /// Add a header.
    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.req = self.req.header(key, value);
        self
    }

    /// Add several headers.
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        for (key, value) in headers {
            self.req = self.req.header(key, value);
        }

        self
    }

    /// Mutable access to the headers set so far.
    pub fn headers_mut(&mut self) -> Option<&mut http::header::HeaderMap> {
        self.req.headers_mut()
    }

    /// Append url-encoded query parameters.
    pub fn query<T: Serialize + ?Sized>(mut self, query: &T) -> Self {
        match serde_urlencoded::to_string(query) {
            Ok(encoded) if encoded.is_empty() => {}
            Ok(encoded) => {
                let sep = if self.uri.contains('?') { '&' } else { '?' };
                self.uri.push(sep);
                self.uri.push_str(&encoded);
            }
            Err(error) => self.error = Some(error.into()),
        }
        self
    }

    /// Fail the request if no response arrives within `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the request body.
    pub fn body<B: Into<hyperdriver::Body>>(self, body: B) -> Self {
        Self {
            body: Some(body.into()),
            ..self
        }
    }

    /// Stream the request body from `reader` as it is sent.
    pub fn body_reader<R>(self, reader: R) -> Self
    where
        R: tokio::io::AsyncRead + Send + Sync + 'static,
    {
        let frames = tokio_util::io::ReaderStream::new(reader).map_ok(http_body::Frame::data);
        self.body(hyperdriver::Body::new(http_body_util::StreamBody::new(frames)))
    }

    /// Serialize `value` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(body) => {
                self.req = self
                    .req
                    .header(http::header::CONTENT_TYPE, "application/json");
                self.body = Some(hyperdriver::Body::from(bytes::Bytes::from(body)));
            }
            Err(error) => self.error = Some(error.into()),
        }
        self
    }

    /// Serialize `value` as a form-encoded request body.
    pub fn form<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_urlencoded::to_string(value) {
            Ok(body) => {
                self.req = self.req.header(
                    http::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                );
                self.body = Some(hyperdriver::Body::from(bytes::Bytes::from(body)));
            }
            Err(error) => self.error = Some(error.into()),
        }
        self
    }

    /// Send the request.
    pub async fn send(self) -> Result<Response, Error>
    where
        A: Authentication,
    {
        if let Some(error) = self.error {
            return Err(error);
        }

        let req = self
            .req
            .uri(self.uri)
            .body(self.body.unwrap_or_else(hyperdriver::Body::empty))?;

        if let Some(timeout) = self.timeout {
            match tokio::time::timeout(timeout, self.client.execute(req)).await {
                Ok(res) => res,
                Err(_) => Err(Error::Request(hyperdriver::client::Error::RequestTimeout)),
            }
        } else {
            self.client.execute(req).await
        }
    }
}

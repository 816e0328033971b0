//! HTTP client plumbing shared by the registry adapters.
//!
//! [`ApiClient`] wraps a hyperdriver transport with a base URL and an
//! [`Authentication`] mechanism. Endpoints are joined onto the base URL unless
//! they are already absolute, which is how upload `Location` headers are followed.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use http::Method;
use http::Uri;
use hyperdriver::service::SharedService;
pub use secret::Secret;

mod authentication;
pub mod error;
pub mod paginate;
pub mod request;
pub mod response;
pub mod uri;

pub use self::authentication::{
    basic_auth, Authentication, AuthenticationLayer, AuthenticationService, BasicAuth, BearerAuth,
};
pub use self::error::{Error, HttpResponseError};
pub use self::request::RequestBuilder;
pub use self::request::RequestExt;
pub use self::response::Response;
use self::uri::UriExtension as _;

/// The transport every client is built on.
pub type Transport = hyperdriver::client::SharedClientService<hyperdriver::Body, hyperdriver::Body>;

/// A boxed, sendable future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Build the default TCP + TLS transport.
pub fn default_transport() -> Transport {
    hyperdriver::Client::build_tcp_http()
        .with_default_tls()
        .build_service()
}

/// Wrap any compatible service (for example [`mock::MockService`]) as a [`Transport`].
pub fn shared_service<S>(inner: S) -> Transport
where
    S: tower::Service<
            http::Request<hyperdriver::Body>,
            Response = http::Response<hyperdriver::Body>,
            Error = hyperdriver::client::Error,
        > + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    tower::ServiceBuilder::new()
        .layer(SharedService::layer())
        .service(inner)
}

/// A client for accessing APIs over HTTP / HTTPS
///
/// Useful inner object to wrap for individual API clients.
#[derive(Debug, Clone)]
pub struct ApiClient<A> {
    base: Uri,
    inner: Transport,
    _auth: PhantomData<fn() -> A>,
}

impl<A> ApiClient<A>
where
    A: Authentication + Send + Sync + 'static,
{
    /// Create a new API Client which sends requests through `inner`.
    ///
    /// Every request is authorized with `authentication` before it reaches `inner`.
    pub fn new_with_inner_service<S>(base: Uri, authentication: A, inner: S) -> Self
    where
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(AuthenticationLayer::new(Arc::new(authentication)))
            .service(inner);

        ApiClient {
            base,
            inner: service,
            _auth: PhantomData,
        }
    }
}

impl<A> ApiClient<A>
where
    A: Authentication,
{
    /// The current base URL.
    pub fn base(&self) -> Uri {
        self.base.clone()
    }

    /// Resolve an endpoint against the base URL.
    ///
    /// Absolute URLs are returned unchanged, absolute paths replace the base path,
    /// and relative paths are appended to it.
    pub fn resolve(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.to_owned()
        } else {
            self.base().join(endpoint)
        }
    }

    /// Start a request with an arbitrary method.
    pub fn request(&self, method: Method, endpoint: &str) -> RequestBuilder<A> {
        RequestBuilder::new(self.clone(), self.resolve(endpoint), method)
    }

    /// Start a `GET` request.
    pub fn get(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::GET, endpoint)
    }

    /// Start a `HEAD` request.
    pub fn head(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::HEAD, endpoint)
    }

    /// Start a `PUT` request.
    pub fn put(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::PUT, endpoint)
    }

    /// Start a `POST` request.
    pub fn post(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::POST, endpoint)
    }

    /// Start a `PATCH` request.
    pub fn patch(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::PATCH, endpoint)
    }

    /// Start a `DELETE` request.
    pub fn delete(&self, endpoint: &str) -> RequestBuilder<A> {
        self.request(Method::DELETE, endpoint)
    }

    /// Send a fully built request.
    pub async fn execute(&self, req: http::Request<hyperdriver::Body>) -> Result<Response, Error> {
        use tower::ServiceExt as _;

        let parts = req.parts();

        tracing::trace!(method = %parts.method, uri = %parts.uri, "sending request");
        let response = self
            .inner
            .clone()
            .oneshot(req)
            .await
            .map_err(Error::Request)?;
        Ok(Response::new(parts, response))
    }
}

pub mod mock {
    //! A recording transport for tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::Arc;

    use bytes::Bytes;
    use http::{HeaderMap, Method, StatusCode};
    use http_body_util::BodyExt as _;
    use parking_lot::Mutex;

    use crate::BoxFuture;

    /// A canned response.
    #[derive(Debug, Clone)]
    pub struct MockResponse {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    }

    impl MockResponse {
        /// Create a response with the given status, headers and body.
        pub fn new(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
            Self {
                status,
                headers,
                body: body.into(),
            }
        }

        /// A response with only a status code.
        pub fn status(status: StatusCode) -> Self {
            Self::new(status, HeaderMap::new(), Bytes::new())
        }

        /// Add a header to the response.
        pub fn with_header(mut self, name: http::HeaderName, value: &str) -> Self {
            if let Ok(value) = http::HeaderValue::from_str(value) {
                self.headers.append(name, value);
            }
            self
        }
    }

    /// A request observed by the mock.
    #[derive(Debug, Clone)]
    pub struct RecordedRequest {
        /// Request method.
        pub method: Method,
        /// Full request URI.
        pub uri: http::Uri,
        /// Request headers.
        pub headers: HeaderMap,
        /// Collected request body.
        pub body: Bytes,
    }

    #[derive(Debug, Default)]
    struct MockState {
        responses: HashMap<(Method, String), VecDeque<MockResponse>>,
        requests: Vec<RecordedRequest>,
    }

    /// A transport answering from canned responses keyed by method and path.
    ///
    /// Queued responses are served in order, and the last one is repeated.
    /// Unknown routes answer `404 Not Found`. Every request is recorded.
    #[derive(Debug, Default, Clone)]
    pub struct MockService {
        state: Arc<Mutex<MockState>>,
    }

    impl MockService {
        /// Create an empty mock.
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue a response for `method` on `path`.
        pub fn add(&self, method: Method, path: &str, response: MockResponse) {
            self.state
                .lock()
                .responses
                .entry((method, path.to_owned()))
                .or_default()
                .push_back(response);
        }

        /// Every request seen so far.
        pub fn requests(&self) -> Vec<RecordedRequest> {
            self.state.lock().requests.clone()
        }

        /// Requests seen for `method` on `path`.
        pub fn requests_to(&self, method: &Method, path: &str) -> Vec<RecordedRequest> {
            self.state
                .lock()
                .requests
                .iter()
                .filter(|req| req.method == *method && req.uri.path() == path)
                .cloned()
                .collect()
        }

        fn respond(&self, method: &Method, path: &str) -> MockResponse {
            let mut state = self.state.lock();
            match state.responses.get_mut(&(method.clone(), path.to_owned())) {
                Some(queue) if queue.len() > 1 => queue
                    .pop_front()
                    .unwrap_or_else(|| MockResponse::status(StatusCode::NOT_FOUND)),
                Some(queue) => queue
                    .front()
                    .cloned()
                    .unwrap_or_else(|| MockResponse::status(StatusCode::NOT_FOUND)),
                None => MockResponse::status(StatusCode::NOT_FOUND),
            }
        }
    }

    impl tower::Service<http::Request<hyperdriver::Body>> for MockService {
        type Response = http::Response<hyperdriver::Body>;
        type Error = hyperdriver::client::Error;
        type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

        fn poll_ready(
            &mut self,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
            let this = self.clone();
            Box::pin(async move {
                let (parts, body) = req.into_parts();
                let body = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(_) => Bytes::new(),
                };

                let canned = this.respond(&parts.method, parts.uri.path());
                this.state.lock().requests.push(RecordedRequest {
                    method: parts.method,
                    uri: parts.uri,
                    headers: parts.headers,
                    body,
                });

                let mut response = http::Response::new(hyperdriver::Body::from(canned.body));
                *response.status_mut() = canned.status;
                *response.version_mut() = http::Version::HTTP_11;
                *response.headers_mut() = canned.headers;
                Ok(response)
            })
        }
    }
}

#[cfg(test)]
mod test {

    use self::mock::{MockResponse, MockService};
    use self::response::{ResponseBodyExt as _, ResponseExt as _};

    use super::*;

    #[test]
    fn extensions_produce_send_futures() {
        let client = ApiClient::new_with_inner_service(
            "http://registry.example/v2/".parse().unwrap(),
            BearerAuth::new(Secret::from("secret garden")),
            MockService::new(),
        );
        let builder = client.get("library/alpine/tags/list");

        fn assert_send<T: Send>(_t: T) {}

        let fut = builder.send();
        assert_send(fut);
    }

    #[test]
    fn resolve_follows_absolute_locations() {
        let client = ApiClient::new_with_inner_service(
            "https://registry.example/v2/".parse().unwrap(),
            (),
            MockService::new(),
        );

        assert_eq!(
            client.resolve("/v2/app/blobs/uploads/abc"),
            "https://registry.example/v2/app/blobs/uploads/abc"
        );
        assert_eq!(
            client.resolve("https://storage.example/upload?id=1"),
            "https://storage.example/upload?id=1"
        );
        assert_eq!(
            client.resolve("app/tags/list"),
            "https://registry.example/v2/app/tags/list"
        );
    }

    #[tokio::test]
    async fn mock_client_records_requests() {
        let mock = MockService::new();
        mock.add(
            Method::GET,
            "/v2/app/manifests/latest",
            MockResponse::new(http::StatusCode::OK, http::HeaderMap::new(), "{}"),
        );

        let client = ApiClient::new_with_inner_service(
            "http://registry.example/v2/".parse().unwrap(),
            BearerAuth::new(Secret::from("secret garden")),
            mock.clone(),
        );

        let response = client.get("app/manifests/latest").send().await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "{}");

        let missing = client.delete("app/manifests/latest").send().await.unwrap();
        assert_eq!(missing.status(), http::StatusCode::NOT_FOUND);

        let seen = mock.requests_to(&Method::GET, "/v2/app/manifests/latest");
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].headers.get(http::header::AUTHORIZATION).unwrap(),
            "Bearer secret garden"
        );
        assert_eq!(mock.requests().len(), 2);
    }

    #[tokio::test]
    async fn queued_responses_are_served_in_order() {
        let mock = MockService::new();
        mock.add(
            Method::HEAD,
            "/v2/app/blobs/sha256:aa",
            MockResponse::status(http::StatusCode::NOT_FOUND),
        );
        mock.add(
            Method::HEAD,
            "/v2/app/blobs/sha256:aa",
            MockResponse::status(http::StatusCode::OK),
        );

        let client = ApiClient::new_with_inner_service(
            "http://registry.example/v2/".parse().unwrap(),
            (),
            mock,
        );

        for expected in [404, 200, 200] {
            let response = client.head("app/blobs/sha256:aa").send().await.unwrap();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}

//! User token providers.

use crate::events::BindingError;
use crate::http::HttpClient;
use pushsync_protocol::{HttpMethod, HttpRequest};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Supplies the bearer token that proves the device belongs to a user.
///
/// Usually backed by a call to the host application's own backend. It is
/// invoked on a helper thread and abandoned if it does not answer within
/// the configured timeout.
pub trait TokenProvider: Send + Sync {
    /// Returns a bearer token for `user_id`.
    fn fetch_token(&self, user_id: &str) -> Result<String, String>;
}

impl<F> TokenProvider for F
where
    F: Fn(&str) -> Result<String, String> + Send + Sync,
{
    fn fetch_token(&self, user_id: &str) -> Result<String, String> {
        self(user_id)
    }
}

/// Headers and URL parameters attached to an auth request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthData {
    /// Request headers, e.g. the host's session cookie.
    pub headers: BTreeMap<String, String>,
    /// Query parameters appended to the auth URL.
    pub url_params: BTreeMap<String, String>,
}

impl AuthData {
    /// Empty auth data.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Adds a URL parameter.
    #[must_use]
    pub fn with_url_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.url_params.insert(name.into(), value.into());
        self
    }
}

type AuthDataFn = dyn Fn() -> AuthData + Send + Sync;

/// [`TokenProvider`] that asks the host's own auth endpoint.
///
/// Each fetch POSTs to `auth_url` with `user_id` and the callback's URL
/// parameters in the query and the callback's headers attached. A 2xx
/// response body is the token.
///
/// # Example
///
/// ```rust
/// use pushsync_engine::{AuthData, HttpTokenProvider, LoopbackClient, TokenProvider};
/// use pushsync_protocol::{HttpRequest, HttpResponse};
///
/// let client = LoopbackClient::new(|_: &HttpRequest| HttpResponse {
///     status: 200,
///     body: b"signed-token".to_vec(),
/// });
/// let provider = HttpTokenProvider::new("https://app.example.com/auth", client, || {
///     AuthData::new().with_header("Cookie", "session=abc")
/// });
/// assert_eq!(provider.fetch_token("alice").unwrap(), "signed-token");
/// ```
pub struct HttpTokenProvider<C: HttpClient> {
    auth_url: String,
    client: C,
    auth_data: Box<AuthDataFn>,
}

impl<C: HttpClient> HttpTokenProvider<C> {
    /// Creates a provider posting to `auth_url`. `auth_data` runs before
    /// every request.
    pub fn new<F>(auth_url: impl Into<String>, client: C, auth_data: F) -> Self
    where
        F: Fn() -> AuthData + Send + Sync + 'static,
    {
        Self {
            auth_url: auth_url.into(),
            client,
            auth_data: Box::new(auth_data),
        }
    }

    /// Returns the auth URL.
    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    fn build_request(&self, user_id: &str) -> Result<HttpRequest, String> {
        let auth = (self.auth_data)();
        let mut url =
            Url::parse(&self.auth_url).map_err(|e| format!("invalid auth url: {e}"))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("user_id", user_id);
            for (name, value) in &auth.url_params {
                query.append_pair(name, value);
            }
        }

        let mut request = HttpRequest::new(HttpMethod::Post, url.as_str());
        for (name, value) in auth.headers {
            request = request.with_header(name, value);
        }
        Ok(request)
    }
}

impl<C: HttpClient> TokenProvider for HttpTokenProvider<C> {
    fn fetch_token(&self, user_id: &str) -> Result<String, String> {
        let request = self.build_request(user_id)?;
        debug!(url = %request.url, "requesting user token");
        let response = self.client.execute(request)?;

        if !response.is_success() {
            return Err(format!(
                "auth endpoint returned {}: {}",
                response.status,
                response.reason()
            ));
        }
        let token = String::from_utf8(response.body)
            .map_err(|_| "auth endpoint returned a non-UTF-8 token".to_string())?;
        let token = token.trim();
        if token.is_empty() {
            return Err("auth endpoint returned an empty token".into());
        }
        Ok(token.to_string())
    }
}

impl<C: HttpClient> fmt::Debug for HttpTokenProvider<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTokenProvider")
            .field("auth_url", &self.auth_url)
            .finish_non_exhaustive()
    }
}

/// Calls `provider` on a helper thread and waits at most `timeout`.
pub(crate) fn fetch_with_timeout(
    provider: &Arc<dyn TokenProvider>,
    user_id: &str,
    timeout: Duration,
) -> Result<String, BindingError> {
    let (tx, rx) = mpsc::channel();
    let provider = Arc::clone(provider);
    let user = user_id.to_string();

    std::thread::Builder::new()
        .name("pushsync-token".into())
        .spawn(move || {
            let result = provider.fetch_token(&user);
            // The receiver is gone if we already timed out.
            let _ = tx.send(result);
        })
        .map_err(|e| BindingError::TokenProvider(format!("could not start provider: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(token)) => Ok(token),
        Ok(Err(reason)) => Err(BindingError::TokenProvider(reason)),
        Err(RecvTimeoutError::Timeout) => {
            warn!(user_id, ?timeout, "token provider timed out");
            Err(BindingError::TokenProviderTimeout(timeout))
        }
        Err(RecvTimeoutError::Disconnected) => Err(BindingError::TokenProvider(
            "token provider panicked".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::LoopbackClient;
    use parking_lot::Mutex;
    use pushsync_protocol::HttpResponse;

    fn provider<F>(f: F) -> Arc<dyn TokenProvider>
    where
        F: Fn(&str) -> Result<String, String> + Send + Sync + 'static,
    {
        Arc::new(f)
    }

    #[test]
    fn returns_provider_token() {
        let p = provider(|user| Ok(format!("token-for-{user}")));
        let token = fetch_with_timeout(&p, "alice", Duration::from_secs(1)).unwrap();
        assert_eq!(token, "token-for-alice");
    }

    #[test]
    fn provider_errors_are_reported() {
        let p = provider(|_| Err("backend down".into()));
        let err = fetch_with_timeout(&p, "alice", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, BindingError::TokenProvider("backend down".into()));
    }

    #[test]
    fn slow_provider_times_out() {
        let p = provider(|_| {
            std::thread::sleep(Duration::from_millis(500));
            Ok("late".into())
        });
        let err = fetch_with_timeout(&p, "alice", Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, BindingError::TokenProviderTimeout(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[test]
    fn panicking_provider_is_a_failure() {
        let p = provider(|_| panic!("provider bug"));
        let err = fetch_with_timeout(&p, "alice", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, BindingError::TokenProvider(_)));
    }

    fn auth_server(
        status: u16,
        body: &'static str,
    ) -> (
        Arc<Mutex<Vec<HttpRequest>>>,
        LoopbackClient<impl Fn(&HttpRequest) -> HttpResponse + Send + Sync>,
    ) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let client = LoopbackClient::new(move |request: &HttpRequest| {
            log.lock().push(request.clone());
            HttpResponse {
                status,
                body: body.as_bytes().to_vec(),
            }
        });
        (seen, client)
    }

    #[test]
    fn http_provider_posts_auth_data() {
        let (seen, client) = auth_server(200, "signed-token\n");
        let provider = HttpTokenProvider::new("https://app.test/auth?v=2", client, || {
            AuthData::new()
                .with_header("Cookie", "session=abc")
                .with_url_param("team", "red sox")
        });

        assert_eq!(provider.fetch_token("alice").unwrap(), "signed-token");

        let requests = seen.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(
            request.url,
            "https://app.test/auth?v=2&user_id=alice&team=red+sox"
        );
        assert_eq!(
            request.headers,
            vec![("Cookie".to_string(), "session=abc".to_string())]
        );
    }

    #[test]
    fn http_provider_rejects_failed_or_empty_responses() {
        let (_, client) = auth_server(403, "");
        let provider = HttpTokenProvider::new("https://app.test/auth", client, AuthData::new);
        let err = provider.fetch_token("alice").unwrap_err();
        assert!(err.contains("403"), "{err}");

        let (_, client) = auth_server(200, "  ");
        let provider = HttpTokenProvider::new("https://app.test/auth", client, AuthData::new);
        assert!(provider.fetch_token("alice").unwrap_err().contains("empty"));

        let (seen, client) = auth_server(200, "token");
        let provider = HttpTokenProvider::new("not a url", client, AuthData::new);
        assert!(provider.fetch_token("alice").is_err());
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn http_provider_failure_surfaces_as_binding_error() {
        let (_, client) = auth_server(500, "");
        let p: Arc<dyn TokenProvider> = Arc::new(HttpTokenProvider::new(
            "https://app.test/auth",
            client,
            AuthData::new,
        ));
        let err = fetch_with_timeout(&p, "alice", Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, BindingError::TokenProvider(_)));
    }
}

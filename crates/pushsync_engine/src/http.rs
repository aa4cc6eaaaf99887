//! HTTP adapter for the device directory.
//!
//! The actual HTTP client is abstracted via a trait so the host can plug in
//! whichever blocking client it already ships (ureq, reqwest::blocking, a
//! platform bridge, ...).

use crate::directory::{DirectoryApi, Registration};
use crate::error::{ApiError, ApiResult};
use pushsync_protocol::{
    DeviceMetadata, Endpoint, HttpRequest, HttpResponse, InterestSet, RefreshTokenRequest,
    RegisterRequest, RegisterResponse, SetSubscriptionsRequest,
};
use tracing::trace;

/// HTTP client abstraction.
///
/// `Err` means no response arrived (DNS, connect, TLS, timeout). Any
/// response, whatever its status, is `Ok`.
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String>;
}

/// [`DirectoryApi`] over JSON/HTTP.
pub struct HttpDirectory<C: HttpClient> {
    /// Base URL of the directory (e.g. "https://push.example.com/device_api/v1").
    base_url: String,
    /// Directory instance id.
    instance_id: String,
    client: C,
}

impl<C: HttpClient> HttpDirectory<C> {
    /// Creates an adapter for `instance_id` under `base_url`.
    pub fn new(base_url: impl Into<String>, instance_id: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            instance_id: instance_id.into(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn device_endpoint(
        &self,
        device_id: &str,
        build: impl FnOnce(String, String) -> Endpoint,
    ) -> Endpoint {
        build(self.instance_id.clone(), device_id.to_string())
    }

    fn send(&self, endpoint: &Endpoint, request: HttpRequest) -> ApiResult<HttpResponse> {
        trace!(method = %request.method, path = %endpoint.path(), "directory request");
        let response = self.client.execute(request).map_err(ApiError::Network)?;
        if response.is_success() {
            return Ok(response);
        }

        let reason = response.reason();
        if response.status == 404 && endpoint.device().is_none() {
            return Err(ApiError::BadRequest {
                status: 404,
                reason,
            });
        }
        Err(ApiError::from_status(response.status, reason))
    }

    fn request(&self, endpoint: &Endpoint) -> HttpRequest {
        HttpRequest::new(
            endpoint.method(),
            format!("{}{}", self.base_url, endpoint.path()),
        )
    }

    fn send_empty(&self, endpoint: Endpoint) -> ApiResult<()> {
        self.send(&endpoint, self.request(&endpoint)).map(|_| ())
    }

    fn send_json<T: serde::Serialize>(&self, endpoint: Endpoint, body: &T) -> ApiResult<()> {
        let request = self
            .request(&endpoint)
            .with_json(body)
            .map_err(|e| ApiError::BadRequest {
                status: 0,
                reason: e.to_string(),
            })?;
        self.send(&endpoint, request).map(|_| ())
    }
}

impl<C: HttpClient> DirectoryApi for HttpDirectory<C> {
    fn register(
        &self,
        token: &str,
        known_prior_ids: &[String],
        metadata: &DeviceMetadata,
    ) -> ApiResult<Registration> {
        let endpoint = Endpoint::Register {
            instance: self.instance_id.clone(),
        };
        let body = RegisterRequest {
            token: token.to_string(),
            known_previous_client_ids: known_prior_ids.to_vec(),
            metadata: metadata.clone(),
        };
        let request = self
            .request(&endpoint)
            .with_json(&body)
            .map_err(|e| ApiError::BadRequest {
                status: 0,
                reason: e.to_string(),
            })?;

        let response: RegisterResponse = self
            .send(&endpoint, request)?
            .parse()
            .map_err(|e| ApiError::MalformedResponse(e.to_string()))?;
        Ok(Registration {
            device_id: response.id,
            initial_interests: response.initial_interest_set,
        })
    }

    fn refresh_token(&self, device_id: &str, token: &str) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::RefreshToken {
            instance,
            device,
        });
        self.send_json(
            endpoint,
            &RefreshTokenRequest {
                token: token.to_string(),
            },
        )
    }

    fn subscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::Subscribe {
            instance,
            device,
            interest: interest.to_string(),
        });
        self.send_empty(endpoint)
    }

    fn unsubscribe(&self, device_id: &str, interest: &str) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::Unsubscribe {
            instance,
            device,
            interest: interest.to_string(),
        });
        self.send_empty(endpoint)
    }

    fn replace_subscriptions(&self, device_id: &str, interests: &InterestSet) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| {
            Endpoint::SetSubscriptions { instance, device }
        });
        self.send_json(
            endpoint,
            &SetSubscriptionsRequest {
                interests: interests.clone(),
            },
        )
    }

    fn set_metadata(&self, device_id: &str, metadata: &DeviceMetadata) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::SetMetadata {
            instance,
            device,
        });
        self.send_json(endpoint, metadata)
    }

    fn set_user(&self, device_id: &str, bearer_token: &str) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::SetUser {
            instance,
            device,
        });
        let request = self.request(&endpoint).with_bearer(bearer_token);
        self.send(&endpoint, request).map(|_| ())
    }

    fn delete(&self, device_id: &str) -> ApiResult<()> {
        let endpoint = self.device_endpoint(device_id, |instance, device| Endpoint::Delete {
            instance,
            device,
        });
        self.send_empty(endpoint)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer {
    /// Handles a request and returns the response.
    fn handle(&self, request: &HttpRequest) -> HttpResponse;
}

impl<F> LoopbackServer for F
where
    F: Fn(&HttpRequest) -> HttpResponse,
{
    fn handle(&self, request: &HttpRequest) -> HttpResponse {
        self(request)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer + Send + Sync> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

impl<S: LoopbackServer + Send + Sync> HttpClient for LoopbackClient<S> {
    fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
        Ok(self.server.handle(&request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pushsync_protocol::HttpMethod;
    use std::collections::VecDeque;
    use std::sync::Arc;

    #[derive(Default)]
    struct TestClient {
        sent: Mutex<Vec<HttpRequest>>,
        responses: Mutex<VecDeque<Result<HttpResponse, String>>>,
    }

    impl TestClient {
        fn respond(&self, response: Result<HttpResponse, String>) {
            self.responses.lock().push_back(response);
        }
    }

    impl HttpClient for Arc<TestClient> {
        fn execute(&self, request: HttpRequest) -> Result<HttpResponse, String> {
            self.sent.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Ok(HttpResponse::empty(200)))
        }
    }

    fn directory() -> (Arc<TestClient>, HttpDirectory<Arc<TestClient>>) {
        let client = Arc::new(TestClient::default());
        let dir = HttpDirectory::new("https://push.example.com/api/", "inst", Arc::clone(&client));
        (client, dir)
    }

    #[test]
    fn base_url_is_normalized() {
        let (_, dir) = directory();
        assert_eq!(dir.base_url(), "https://push.example.com/api");
    }

    #[test]
    fn register_parses_response() {
        let (client, dir) = directory();
        client.respond(
            HttpResponse::json(
                200,
                &RegisterResponse {
                    id: "dev-9".into(),
                    initial_interest_set: ["a".to_string()].into(),
                },
            )
            .map_err(|e| e.to_string()),
        );

        let reg = dir
            .register("tok", &["old".into()], &DeviceMetadata::new("1", "2"))
            .unwrap();
        assert_eq!(reg.device_id, "dev-9");
        assert!(reg.initial_interests.contains("a"));

        let sent = client.sent.lock()[0].clone();
        assert_eq!(sent.method, HttpMethod::Post);
        assert_eq!(sent.url, "https://push.example.com/api/instances/inst/devices/fcm");
        let body: RegisterRequest = sent.json().unwrap();
        assert_eq!(body.known_previous_client_ids, vec!["old".to_string()]);
    }

    #[test]
    fn device_calls_hit_their_routes() {
        let (client, dir) = directory();
        dir.subscribe("d", "donuts").unwrap();
        dir.unsubscribe("d", "donuts").unwrap();
        dir.replace_subscriptions("d", &InterestSet::new()).unwrap();
        dir.refresh_token("d", "t2").unwrap();
        dir.set_metadata("d", &DeviceMetadata::default()).unwrap();
        dir.set_user("d", "bearer").unwrap();
        dir.delete("d").unwrap();

        let sent = client.sent.lock().clone();
        let routes: Vec<(HttpMethod, String)> = sent
            .iter()
            .map(|r| {
                (
                    r.method,
                    r.url.trim_start_matches("https://push.example.com/api").to_string(),
                )
            })
            .collect();
        let base = "/instances/inst/devices/fcm/d";
        assert_eq!(
            routes,
            vec![
                (HttpMethod::Post, format!("{base}/interests/donuts")),
                (HttpMethod::Delete, format!("{base}/interests/donuts")),
                (HttpMethod::Put, format!("{base}/interests")),
                (HttpMethod::Put, format!("{base}/token")),
                (HttpMethod::Put, format!("{base}/metadata")),
                (HttpMethod::Put, format!("{base}/user")),
                (HttpMethod::Delete, base.to_string()),
            ]
        );
        assert_eq!(sent[5].bearer.as_deref(), Some("bearer"));
    }

    #[test]
    fn statuses_are_classified() {
        let (client, dir) = directory();
        client.respond(Ok(HttpResponse::error(404, "Device not found", "")));
        client.respond(Ok(HttpResponse::error(400, "Invalid interest", "too long")));
        client.respond(Ok(HttpResponse::empty(503)));
        client.respond(Err("connection refused".into()));

        assert_eq!(dir.subscribe("d", "a"), Err(ApiError::DeviceNotFound));
        assert!(matches!(
            dir.subscribe("d", "a"),
            Err(ApiError::BadRequest { status: 400, ref reason }) if reason.contains("too long")
        ));
        assert!(matches!(
            dir.subscribe("d", "a"),
            Err(ApiError::Server { status: 503, .. })
        ));
        assert!(matches!(dir.subscribe("d", "a"), Err(ApiError::Network(_))));
    }

    #[test]
    fn register_404_is_not_device_loss() {
        let (client, dir) = directory();
        client.respond(Ok(HttpResponse::empty(404)));
        let err = dir
            .register("tok", &[], &DeviceMetadata::default())
            .unwrap_err();
        assert!(!err.is_device_not_found());
    }

    #[test]
    fn malformed_register_body() {
        let (client, dir) = directory();
        client.respond(Ok(HttpResponse {
            status: 200,
            body: b"not json".to_vec(),
        }));
        let err = dir
            .register("tok", &[], &DeviceMetadata::default())
            .unwrap_err();
        assert!(matches!(err, ApiError::MalformedResponse(_)));
    }

    #[test]
    fn loopback_routes_to_closure() {
        let client = LoopbackClient::new(|req: &HttpRequest| {
            if req.url.ends_with("/interests/x") {
                HttpResponse::empty(200)
            } else {
                HttpResponse::empty(404)
            }
        });
        let dir = HttpDirectory::new("", "i", client);
        assert!(dir.subscribe("d", "x").is_ok());
        assert_eq!(dir.subscribe("d", "y"), Err(ApiError::DeviceNotFound));
    }
}

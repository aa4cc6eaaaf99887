//! The in-memory directory.

use crate::auth::TokenIssuer;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use parking_lot::{Mutex, RwLock};
use pushsync_protocol::{
    validate_interest, validate_interests, DeviceMetadata, Endpoint, HttpRequest, HttpResponse,
    InterestSet, RefreshTokenRequest, RegisterRequest, RegisterResponse, SetSubscriptionsRequest,
};
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// A device as the directory stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// Device id.
    pub id: String,
    /// Instance the device belongs to.
    pub instance: String,
    /// Current push token.
    pub token: String,
    /// Subscribed interests.
    pub interests: InterestSet,
    /// Last reported metadata.
    pub metadata: DeviceMetadata,
    /// Bound user, if any.
    pub user_id: Option<String>,
}

#[derive(Default)]
struct Registry {
    devices: HashMap<String, DeviceRecord>,
    /// Interests handed to a new registration naming this prior id.
    carried: HashMap<String, InterestSet>,
}

/// Reference device directory.
///
/// Answers the directory routes in-process, keeping every device in
/// memory. Meant for integration tests and local development, so it also
/// exposes fault injection and request bookkeeping.
///
/// # Example
///
/// ```
/// use pushsync_directory::{DirectoryServer, ServerConfig};
/// use pushsync_protocol::{HttpMethod, HttpRequest, RegisterRequest, RegisterResponse};
///
/// let server = DirectoryServer::new(ServerConfig::default());
/// let request = HttpRequest::new(HttpMethod::Post, "/instances/demo/devices/fcm")
///     .with_json(&RegisterRequest {
///         token: "push-token".into(),
///         known_previous_client_ids: vec![],
///         metadata: Default::default(),
///     })
///     .unwrap();
///
/// let response = server.handle(&request);
/// let body: RegisterResponse = response.parse().unwrap();
/// assert!(server.device(&body.id).is_some());
/// ```
pub struct DirectoryServer {
    config: ServerConfig,
    issuer: TokenIssuer,
    registry: RwLock<Registry>,
    faults: Mutex<VecDeque<u16>>,
    requests: Mutex<Vec<Endpoint>>,
}

impl DirectoryServer {
    /// Creates an empty directory.
    pub fn new(config: ServerConfig) -> Self {
        let issuer = TokenIssuer::new(config.auth_secret.clone());
        Self {
            config,
            issuer,
            registry: RwLock::new(Registry::default()),
            faults: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Handles one request.
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let Some(endpoint) = Endpoint::parse(request.method, &request.url) else {
            debug!(method = %request.method, url = %request.url, "no route");
            return ServerError::RouteNotFound(format!("{} {}", request.method, request.url))
                .to_response();
        };
        self.requests.lock().push(endpoint.clone());

        if let Some(status) = self.faults.lock().pop_front() {
            debug!(path = %endpoint.path(), status, "injected failure");
            return ServerError::Injected(status).to_response();
        }

        match self.dispatch(&endpoint, request) {
            Ok(response) => response,
            Err(err) => {
                debug!(path = %endpoint.path(), status = err.status(), error = %err, "request rejected");
                err.to_response()
            }
        }
    }

    fn dispatch(&self, endpoint: &Endpoint, request: &HttpRequest) -> ServerResult<HttpResponse> {
        match endpoint {
            Endpoint::Register { instance } => self.register(instance, request.json()?),
            Endpoint::RefreshToken { instance, device } => {
                let body: RefreshTokenRequest = request.json()?;
                if body.token.is_empty() {
                    return Err(ServerError::InvalidRequest("token is empty".into()));
                }
                self.with_device(instance, device, |record| record.token = body.token)
            }
            Endpoint::Subscribe {
                instance,
                device,
                interest,
            } => {
                validate_interest(interest)?;
                self.with_device(instance, device, |record| {
                    record.interests.insert(interest.clone());
                })
            }
            Endpoint::Unsubscribe {
                instance,
                device,
                interest,
            } => {
                validate_interest(interest)?;
                self.with_device(instance, device, |record| {
                    record.interests.remove(interest);
                })
            }
            Endpoint::SetSubscriptions { instance, device } => {
                let body: SetSubscriptionsRequest = request.json()?;
                validate_interests(&body.interests)?;
                self.with_device(instance, device, |record| record.interests = body.interests)
            }
            Endpoint::SetMetadata { instance, device } => {
                let metadata: DeviceMetadata = request.json()?;
                self.with_device(instance, device, |record| record.metadata = metadata)
            }
            Endpoint::SetUser { instance, device } => {
                self.set_user(instance, device, request.bearer.as_deref())
            }
            Endpoint::Delete { instance, device } => {
                let mut registry = self.registry.write();
                let owned = registry
                    .devices
                    .get(device)
                    .is_some_and(|record| record.instance == *instance);
                if !owned {
                    return Err(ServerError::DeviceNotFound(device.clone()));
                }
                registry.devices.remove(device);
                Ok(HttpResponse::empty(200))
            }
        }
    }

    fn register(&self, instance: &str, body: RegisterRequest) -> ServerResult<HttpResponse> {
        if body.token.is_empty() {
            return Err(ServerError::InvalidRequest("token is empty".into()));
        }

        let mut registry = self.registry.write();
        let initial = body
            .known_previous_client_ids
            .iter()
            .find_map(|prior| {
                registry
                    .carried
                    .get(prior)
                    .or_else(|| registry.devices.get(prior).map(|d| &d.interests))
                    .cloned()
            })
            .unwrap_or_default();

        let id = Uuid::new_v4().to_string();
        registry.devices.insert(
            id.clone(),
            DeviceRecord {
                id: id.clone(),
                instance: instance.to_string(),
                token: body.token,
                interests: initial.clone(),
                metadata: body.metadata,
                user_id: None,
            },
        );
        debug!(device_id = %id, instance, initial = initial.len(), "device registered");

        Ok(HttpResponse::json(
            200,
            &RegisterResponse {
                id,
                initial_interest_set: initial,
            },
        )?)
    }

    fn set_user(
        &self,
        instance: &str,
        device: &str,
        bearer: Option<&str>,
    ) -> ServerResult<HttpResponse> {
        let bearer =
            bearer.ok_or_else(|| ServerError::NotAuthorized("missing bearer token".into()))?;
        let user = self.issuer.verify(bearer)?;

        let mut registry = self.registry.write();
        match registry.devices.get(device) {
            Some(record) if record.instance == instance => {}
            _ => return Err(ServerError::DeviceNotFound(device.to_string())),
        }

        let bound_elsewhere = registry
            .devices
            .values()
            .filter(|r| r.id != device && r.user_id.as_deref() == Some(user.as_str()))
            .count();
        if bound_elsewhere >= self.config.max_devices_per_user {
            return Err(ServerError::TooManyDevices {
                user,
                limit: self.config.max_devices_per_user,
            });
        }

        if let Some(record) = registry.devices.get_mut(device) {
            record.user_id = Some(user);
        }
        Ok(HttpResponse::empty(200))
    }

    fn with_device<F>(&self, instance: &str, device: &str, update: F) -> ServerResult<HttpResponse>
    where
        F: FnOnce(&mut DeviceRecord),
    {
        let mut registry = self.registry.write();
        match registry.devices.get_mut(device) {
            Some(record) if record.instance == instance => {
                update(record);
                Ok(HttpResponse::empty(200))
            }
            _ => Err(ServerError::DeviceNotFound(device.to_string())),
        }
    }

    /// Mints the bearer token a backend would give `user_id`.
    pub fn token_for(&self, user_id: &str) -> String {
        self.issuer.token_for(user_id)
    }

    /// Makes the next request fail with `status`. Calls queue up.
    pub fn fail_next(&self, status: u16) {
        self.faults.lock().push_back(status);
    }

    /// Drops a device as if it had been deleted out of band.
    pub fn forget_device(&self, device_id: &str) -> bool {
        self.registry.write().devices.remove(device_id).is_some()
    }

    /// Interests a registration naming `prior_id` will start with.
    pub fn set_initial_interests(&self, prior_id: impl Into<String>, interests: InterestSet) {
        self.registry.write().carried.insert(prior_id.into(), interests);
    }

    /// Returns a copy of a device record.
    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.registry.read().devices.get(device_id).cloned()
    }

    /// Number of registered devices.
    pub fn device_count(&self) -> usize {
        self.registry.read().devices.len()
    }

    /// Number of routed requests handled so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Routed requests handled so far, oldest first.
    pub fn requests(&self) -> Vec<Endpoint> {
        self.requests.lock().clone()
    }
}

impl Default for DirectoryServer {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

//! Methods an endpoint recognizes, and the payload shapes they expect.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;

use conduit_types::{
    CancelRequestNotification, ExitNotification, LogMessageNotification, NotificationType,
    RequestType, ShowMessageNotification, ShutdownRequest,
};
use serde::de::DeserializeOwned;

/// A type-erased check that a JSON payload deserializes as some type.
#[derive(Clone, Copy)]
pub struct Shape {
    name: &'static str,
    validate: fn(&serde_json::Value) -> Result<(), serde_json::Error>,
}

fn validate_as<T: DeserializeOwned>(value: &serde_json::Value) -> Result<(), serde_json::Error> {
    T::deserialize(value).map(drop)
}

impl Shape {
    #[must_use]
    pub fn of<T: DeserializeOwned>() -> Self {
        Self {
            name: type_name::<T>(),
            validate: validate_as::<T>,
        }
    }

    /// Accepts every payload.
    #[must_use]
    pub fn any() -> Self {
        Self {
            name: "any",
            validate: |_| Ok(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn check(&self, value: &serde_json::Value) -> Result<(), serde_json::Error> {
        (self.validate)(value)
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Shape").field(&self.name).finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct RequestShapes {
    params: Shape,
    result: Shape,
}

/// The set of methods this endpoint understands.
///
/// A strict registry reports unregistered methods as unknown, which the
/// connection answers with `MethodNotFound` (requests) or ignores
/// (notifications). A permissive registry accepts any method with
/// unvalidated params; relaying endpoints use it since they do not interpret
/// what they forward.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    requests: HashMap<String, RequestShapes>,
    notifications: HashMap<String, Shape>,
    permissive: bool,
}

impl MessageRegistry {
    /// An empty, strict registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A strict registry preloaded with `shutdown`, `exit`, `$/cancelRequest`,
    /// `window/logMessage` and `window/showMessage`.
    #[must_use]
    pub fn with_base_protocol() -> Self {
        let mut registry = Self::new();
        registry
            .register_request::<ShutdownRequest>()
            .register_notification::<ExitNotification>()
            .register_notification::<CancelRequestNotification>()
            .register_notification::<LogMessageNotification>()
            .register_notification::<ShowMessageNotification>();
        registry
    }

    /// The base protocol plus acceptance of every other method.
    #[must_use]
    pub fn permissive() -> Self {
        let mut registry = Self::with_base_protocol();
        registry.permissive = true;
        registry
    }

    #[must_use]
    pub fn is_permissive(&self) -> bool {
        self.permissive
    }

    pub fn register_request<R: RequestType>(&mut self) -> &mut Self {
        self.register_request_method(R::METHOD, Shape::of::<R::Params>(), Shape::of::<R::Result>())
    }

    pub fn register_notification<N: NotificationType>(&mut self) -> &mut Self {
        self.register_notification_method(N::METHOD, Shape::of::<N::Params>())
    }

    pub fn register_request_method(
        &mut self,
        method: impl Into<String>,
        params: Shape,
        result: Shape,
    ) -> &mut Self {
        self.requests
            .insert(method.into(), RequestShapes { params, result });
        self
    }

    pub fn register_notification_method(
        &mut self,
        method: impl Into<String>,
        params: Shape,
    ) -> &mut Self {
        self.notifications.insert(method.into(), params);
        self
    }

    /// Expected `params` of an incoming request, or `None` if the method is
    /// unknown.
    #[must_use]
    pub fn request_params(&self, method: &str) -> Option<Shape> {
        match self.requests.get(method) {
            Some(shapes) => Some(shapes.params),
            None if self.permissive => Some(Shape::any()),
            None => None,
        }
    }

    /// Expected `params` of an incoming notification, or `None` if the
    /// method is unknown.
    #[must_use]
    pub fn notification_params(&self, method: &str) -> Option<Shape> {
        match self.notifications.get(method) {
            Some(shape) => Some(*shape),
            None if self.permissive => Some(Shape::any()),
            None => None,
        }
    }

    /// Expected `result` for a request we send with this method.
    #[must_use]
    pub fn result_shape(&self, method: &str) -> Shape {
        self.requests
            .get(method)
            .map_or_else(Shape::any, |shapes| shapes.result)
    }
}

//! Forwarding handlers between two connections.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use conduit_jsonrpc::{Connection, MessageHandler, ReplySink};
use conduit_types::{
    CancelParams, CancelRequestNotification, Notification, NotificationType, Request, RequestId,
};

/// Incoming request id → id of the forwarded request on the target side.
/// `None` until the forwarded id is known.
type IdMap = HashMap<RequestId, Option<RequestId>>;

/// Relays everything one side sends to the `target` connection.
///
/// Requests are re-issued under the target's own ids and answered when the
/// target replies. `$/cancelRequest` is rewritten to the forwarded id, or
/// dropped if the request is no longer in flight.
pub struct Relay {
    target: Connection,
    in_flight: Arc<Mutex<IdMap>>,
}

impl Relay {
    pub fn new(target: Connection) -> Self {
        Self {
            target,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, IdMap> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn forward_cancel(&self, notification: &Notification) {
        let params: CancelParams = match notification.params_as() {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!("Dropping malformed cancel: {e}");
                return;
            }
        };
        let forwarded = self.in_flight().get(&params.id).cloned().flatten();
        match forwarded {
            Some(id) => {
                tracing::debug!(from = %params.id, to = %id, "Forwarding cancel");
                self.target
                    .notify::<CancelRequestNotification>(CancelParams { id });
            }
            None => tracing::debug!(id = %params.id, "Cancel for request not in flight"),
        }
    }
}

impl MessageHandler for Relay {
    fn handle_notification(&self, notification: Notification) {
        if notification.method == CancelRequestNotification::METHOD {
            self.forward_cancel(&notification);
            return;
        }
        self.target
            .send_notification(notification.method, notification.params);
    }

    fn handle_request(&self, request: Request, reply: ReplySink) {
        let incoming = request.id;
        self.in_flight().insert(incoming.clone(), None);

        let in_flight = Arc::clone(&self.in_flight);
        let key = incoming.clone();
        let forwarded = self
            .target
            .send_request(request.method, request.params, move |result| {
                in_flight
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                reply.reply(result);
            });

        // The reply may already have arrived and removed the entry.
        if let Some(slot) = self.in_flight().get_mut(&incoming) {
            *slot = Some(forwarded);
        }
    }
}

//! Subscription state of one websocket connection.
//!
//! A connection owns at most one subscription per operation. Each
//! subscription is a task serving a hub listener through the controller until
//! its token is cancelled by an unsubscribe, by token expiry or by teardown.
//! Teardown first stops accepting subscriptions, then cancels the existing
//! ones and finally joins their tasks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use mds_auth::permissions::MANAGE_INTEL_DELIVERY;
use mds_auth::{authorize, Principal};
use mds_core::{Error, OperationId, Result};

use crate::controller::{Controller, OpenDeliveries};
use crate::hub::Listener;
use crate::store::NotifierStore;
use crate::ws::protocol::{ClientMessage, ErrorReply, OpenIntelDeliveries, ServerMessage, Subscriptions};

/// Outbound side of a peer.
#[async_trait]
pub trait Peer: Send + Sync {
    async fn send(&self, message: ServerMessage) -> Result<()>;
}

/// Serialises hub snapshots of one operation to the peer.
struct OpenDeliveriesListener {
    peer: Arc<dyn Peer>,
    operation: OperationId,
}

#[async_trait]
impl Listener<OpenDeliveries> for OpenDeliveriesListener {
    async fn notify(&self, cancel: &CancellationToken, snapshot: &OpenDeliveries) -> bool {
        let message = ServerMessage::OpenIntelDeliveries(OpenIntelDeliveries {
            operation: self.operation,
            entries: snapshot.clone(),
        });
        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            sent = self.peer.send(message) => sent,
        };
        match sent {
            Ok(()) => true,
            Err(err) => {
                debug!(operation = %self.operation, error = %err, "open intel deliveries not sent");
                false
            }
        }
    }
}

#[derive(Debug)]
struct Subs {
    accept: bool,
    active: HashMap<OperationId, CancellationToken>,
}

pub struct Connection<D> {
    controller: Arc<Controller<D>>,
    peer: Arc<dyn Peer>,
    principal: Principal,
    lifetime: CancellationToken,
    subs: Mutex<Subs>,
    tasks: TaskTracker,
}

impl<D: NotifierStore> Connection<D> {
    /// `lifetime` bounds every subscription; it ends with the peer's token.
    pub fn new(
        controller: Arc<Controller<D>>,
        peer: Arc<dyn Peer>,
        principal: Principal,
        lifetime: CancellationToken,
    ) -> Self {
        Self {
            controller,
            peer,
            principal,
            lifetime,
            subs: Mutex::new(Subs {
                accept: true,
                active: HashMap::new(),
            }),
            tasks: TaskTracker::new(),
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// Handle one text frame from the peer.
    pub async fn handle_message(&self, raw: &str) -> Result<()> {
        match ClientMessage::parse(raw)? {
            ClientMessage::SubscribeOpenIntelDeliveries(r) => self.subscribe(r.operation).await,
            ClientMessage::UnsubscribeOpenIntelDeliveries(r) => self.unsubscribe(r.operation).await,
            ClientMessage::Heartbeat => self.peer.send(ServerMessage::Heartbeat).await,
        }
    }

    /// Report `err` to the peer without closing the connection.
    pub async fn reply_error(&self, err: &Error) -> Result<()> {
        self.peer.send(ServerMessage::Error(ErrorReply::from(err))).await
    }

    pub async fn subscribe(&self, operation: OperationId) -> Result<()> {
        authorize(&self.principal, &MANAGE_INTEL_DELIVERY)?;

        let token = {
            let mut subs = self.subs.lock().map_err(|_| Error::fatal("subscription state poisoned"))?;
            if !subs.accept {
                return Err(Error::internal("connection is closing"));
            }
            if subs.active.contains_key(&operation) {
                return Ok(());
            }
            let token = self.lifetime.child_token();
            subs.active.insert(operation, token.clone());
            token
        };
        debug!(%operation, user = %self.principal.user_id, "subscribed to open intel deliveries");

        if let Err(err) = self.send_subscriptions().await {
            if let Ok(mut subs) = self.subs.lock() {
                subs.active.remove(&operation);
            }
            token.cancel();
            return Err(err);
        }

        let controller = self.controller.clone();
        let listener = Arc::new(OpenDeliveriesListener {
            peer: self.peer.clone(),
            operation,
        });
        self.tasks.spawn(async move {
            controller.serve_listener(&token, operation, listener).await;
        });
        Ok(())
    }

    pub async fn unsubscribe(&self, operation: OperationId) -> Result<()> {
        let removed = {
            let mut subs = self.subs.lock().map_err(|_| Error::fatal("subscription state poisoned"))?;
            subs.active.remove(&operation)
        };
        if let Some(token) = removed {
            token.cancel();
            debug!(%operation, "unsubscribed from open intel deliveries");
        }
        self.send_subscriptions().await
    }

    /// Operations currently subscribed, sorted.
    pub fn subscriptions(&self) -> Vec<OperationId> {
        let mut operations: Vec<OperationId> = match self.subs.lock() {
            Ok(subs) => subs.active.keys().copied().collect(),
            Err(_) => Vec::new(),
        };
        operations.sort();
        operations
    }

    async fn send_subscriptions(&self) -> Result<()> {
        let operations = self.subscriptions();
        self.peer
            .send(ServerMessage::SubscribedOpenIntelDeliveries(Subscriptions { operations }))
            .await
    }

    /// Stop accepting subscriptions, cancel all of them and wait for their tasks.
    pub async fn teardown(&self) {
        let tokens: Vec<CancellationToken> = match self.subs.lock() {
            Ok(mut subs) => {
                subs.accept = false;
                subs.active.drain().map(|(_, token)| token).collect()
            }
            Err(_) => {
                warn!("subscription state poisoned; cancelling connection lifetime");
                self.lifetime.cancel();
                Vec::new()
            }
        };
        for token in tokens {
            token.cancel();
        }
        self.tasks.close();
        self.tasks.wait().await;
        debug!(user = %self.principal.user_id, "connection torn down");
    }
}

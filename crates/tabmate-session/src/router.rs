//! Inbound frame routing.
//!
//! [`route`] turns one decoded frame into the hub instructions it implies and
//! is free of I/O. [`MessageRouter`] carries those instructions out against a
//! live hub and the reconciler.

use tabmate_core::{
    ClientFrame, ConnectionId, ItemDelta, Principal, ServerEvent, ServerFrame, Store,
};
use tracing::{debug, warn};

use crate::{
    hub::{HubError, HubHandle, Scope},
    reconciler::Reconciler,
};

/// Something the hub (or the reconciler) must do for an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Broadcast { frame: ServerFrame, scope: Scope },
    SendRoster { scope: Scope },
    /// Remove the sender and tell the others.
    Leave,
    Reconcile { updates: Vec<ItemDelta> },
}

/// Whether the reader should keep reading after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// Name shown to others for `principal`, falling back to what the client sent.
fn display_name(principal: &Principal, claimed: &str) -> String {
    if principal.has_display_name() {
        principal.display_name.clone()
    } else {
        claimed.to_string()
    }
}

/// Map a frame from `origin` to the instructions it implies.
#[must_use]
pub fn route(
    origin: ConnectionId,
    principal: &Principal,
    frame: ClientFrame,
) -> Vec<Instruction> {
    match frame {
        ClientFrame::Chat { content } => vec![Instruction::Broadcast {
            frame: ServerFrame::chat(principal.display_name.clone(), content),
            scope: Scope::AllExcept(origin),
        }],
        ClientFrame::UserJoined { username } => vec![Instruction::Broadcast {
            frame: ServerEvent::UserJoined {
                username: display_name(principal, &username),
            }
            .into(),
            scope: Scope::AllExcept(origin),
        }],
        ClientFrame::UserDisconnected { .. } => vec![Instruction::Leave],
        ClientFrame::MenuAdd { username, item } => vec![Instruction::Broadcast {
            frame: ServerEvent::MenuAdd {
                username: display_name(principal, &username),
                item,
            }
            .into(),
            scope: Scope::All,
        }],
        ClientFrame::MenuRemove { username, item } => vec![Instruction::Broadcast {
            frame: ServerEvent::MenuRemove {
                username: display_name(principal, &username),
                item,
            }
            .into(),
            scope: Scope::All,
        }],
        ClientFrame::RequestUsernames => vec![Instruction::SendRoster {
            scope: Scope::Only(origin),
        }],
        ClientFrame::OrderSync { updates } => vec![Instruction::Reconcile { updates }],
        ClientFrame::Unknown => Vec::new(),
    }
}

/// Applies routed instructions for the connections of one table.
pub struct MessageRouter<S> {
    hub: HubHandle,
    reconciler: Reconciler<S>,
}

impl<S> Clone for MessageRouter<S> {
    fn clone(&self) -> Self {
        Self {
            hub: self.hub.clone(),
            reconciler: self.reconciler.clone(),
        }
    }
}

impl<S: Store> MessageRouter<S> {
    /// Router over `hub` writing orders through `reconciler`.
    #[must_use]
    pub const fn new(hub: HubHandle, reconciler: Reconciler<S>) -> Self {
        Self { hub, reconciler }
    }

    /// Hub this router dispatches to.
    #[must_use]
    pub const fn hub(&self) -> &HubHandle {
        &self.hub
    }

    /// Decode and act on one text frame.
    ///
    /// Malformed and unrecognised frames are logged and dropped; the sender
    /// stays connected.
    pub async fn handle_text(
        &self,
        origin: ConnectionId,
        principal: &Principal,
        text: &str,
    ) -> Flow {
        let frame = match ClientFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    table_code = %self.hub.code(),
                    connection_id = %origin,
                    error = %e,
                    "Dropping malformed frame"
                );
                return Flow::Continue;
            }
        };
        if frame == ClientFrame::Unknown {
            warn!(
                table_code = %self.hub.code(),
                connection_id = %origin,
                "Dropping frame with unknown type"
            );
            return Flow::Continue;
        }

        let mut flow = Flow::Continue;
        for instruction in route(origin, principal, frame) {
            match self.apply(origin, principal, instruction).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Disconnect) => flow = Flow::Disconnect,
                Err(e) => {
                    warn!(connection_id = %origin, error = %e, "Hub unavailable");
                    return Flow::Disconnect;
                }
            }
        }
        flow
    }

    /// Carry out one instruction on behalf of `origin`.
    ///
    /// # Errors
    /// Returns error if the hub has stopped.
    pub async fn apply(
        &self,
        origin: ConnectionId,
        principal: &Principal,
        instruction: Instruction,
    ) -> Result<Flow, HubError> {
        match instruction {
            Instruction::Broadcast { frame, scope } => {
                self.hub.broadcast(frame, scope).await?;
            }
            Instruction::SendRoster { scope } => {
                self.hub.send_roster(scope).await?;
            }
            Instruction::Leave => {
                debug!(connection_id = %origin, "Client left table");
                self.hub.leave(origin).await?;
                return Ok(Flow::Disconnect);
            }
            Instruction::Reconcile { updates } => {
                self.sync_order(origin, principal, updates).await?;
            }
        }
        Ok(Flow::Continue)
    }

    async fn sync_order(
        &self,
        origin: ConnectionId,
        principal: &Principal,
        updates: Vec<ItemDelta>,
    ) -> Result<(), HubError> {
        match self.reconciler.reconcile(self.hub.code(), &updates).await {
            Ok(_) => {
                let claimed = updates
                    .iter()
                    .find_map(|u| u.username.as_deref())
                    .unwrap_or_default();
                let frame: ServerFrame = ServerEvent::OrderSynced {
                    username: display_name(principal, claimed),
                    updates,
                }
                .into();
                self.hub.broadcast(frame, Scope::All).await
            }
            Err(e) => {
                warn!(
                    table_code = %self.hub.code(),
                    connection_id = %origin,
                    error = %e,
                    "Order sync failed"
                );
                self.hub
                    .broadcast(
                        ServerFrame::error(format!("order sync failed: {e}")),
                        Scope::Only(origin),
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tabmate_core::{
        NewTable, Price, TableCode, UserId,
        mailbox::{MailboxReceiver, mailbox},
    };
    use uuid::Uuid;

    use super::*;
    use crate::{
        hub::{HubConfig, Payload, Registration},
        storage::MemoryStore,
    };

    fn principal(name: &str) -> Principal {
        Principal::new(UserId(Uuid::new_v4()), name)
    }

    async fn setup() -> (Arc<MemoryStore>, MessageRouter<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let table = store
            .create_table(NewTable {
                code: TableCode::new("rout0001"),
                name: "Brunch".into(),
                restaurant: "Corner Cafe".into(),
                created_by: UserId(Uuid::new_v4()),
            })
            .await
            .unwrap();
        let hub = HubHandle::spawn(table.code, table.id, &HubConfig::default());
        let router = MessageRouter::new(hub, Reconciler::new(Arc::clone(&store)));
        (store, router)
    }

    async fn join(
        router: &MessageRouter<MemoryStore>,
        who: &Principal,
    ) -> (ConnectionId, MailboxReceiver<Payload>) {
        let id = ConnectionId::new();
        let (tx, rx) = mailbox(16);
        router
            .hub()
            .register(Registration {
                id,
                principal: who.clone(),
                mailbox: tx,
            })
            .await
            .unwrap();
        (id, rx)
    }

    /// Waits until the hub has processed everything queued so far.
    async fn settle(router: &MessageRouter<MemoryStore>) {
        router.hub().snapshot().await.unwrap();
    }

    fn json(payload: &Payload) -> serde_json::Value {
        serde_json::from_str(payload).unwrap()
    }

    #[test]
    fn chat_goes_to_everyone_but_the_sender() {
        let origin = ConnectionId::new();
        let instructions = route(
            origin,
            &principal("Ana"),
            ClientFrame::Chat {
                content: "hi".into(),
            },
        );
        assert_eq!(
            instructions,
            vec![Instruction::Broadcast {
                frame: ServerFrame::chat("Ana", "hi"),
                scope: Scope::AllExcept(origin),
            }]
        );
    }

    #[test]
    fn menu_changes_reach_the_sender_too() {
        let instructions = route(
            ConnectionId::new(),
            &principal("Ana"),
            ClientFrame::MenuAdd {
                username: "ignored".into(),
                item: "Fries".into(),
            },
        );
        assert!(matches!(
            instructions.as_slice(),
            [Instruction::Broadcast { scope: Scope::All, .. }]
        ));
    }

    #[test]
    fn blank_principal_falls_back_to_claimed_name() {
        let instructions = route(
            ConnectionId::new(),
            &principal(" "),
            ClientFrame::UserJoined {
                username: "Guest".into(),
            },
        );
        let [Instruction::Broadcast { frame, .. }] = instructions.as_slice() else {
            panic!("expected one broadcast, got {instructions:?}");
        };
        assert_eq!(
            frame,
            &ServerFrame::Event(ServerEvent::UserJoined {
                username: "Guest".into()
            })
        );
    }

    #[test]
    fn unknown_frames_produce_nothing() {
        assert!(route(ConnectionId::new(), &principal("Ana"), ClientFrame::Unknown).is_empty());
    }

    #[tokio::test]
    async fn chat_from_a_reaches_b_only() {
        let (_store, router) = setup().await;
        let a = principal("Ana");
        let (a_id, mut a_rx) = join(&router, &a).await;
        let (_, mut b_rx) = join(&router, &principal("Ben")).await;

        let flow = router
            .handle_text(a_id, &a, r#"{"type":"chat","content":"hi"}"#)
            .await;
        assert_eq!(flow, Flow::Continue);
        settle(&router).await;

        let received = b_rx.try_recv().unwrap();
        assert_eq!(&*received, r#"{"SenderID":"Ana","Content":"hi"}"#);
        assert!(a_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn request_usernames_answers_only_the_requester() {
        let (_store, router) = setup().await;
        let sam = principal("Sam");
        let (sam_id, mut sam_rx) = join(&router, &sam).await;
        let (_, mut lee_rx) = join(&router, &principal("Lee")).await;

        router
            .handle_text(sam_id, &sam, r#"{"type":"request_usernames"}"#)
            .await;
        settle(&router).await;

        let reply = json(&sam_rx.try_recv().unwrap());
        assert_eq!(reply["type"], "user_list");
        let mut names: Vec<String> =
            serde_json::from_value(reply["usernames"].clone()).unwrap();
        names.sort();
        assert_eq!(names, vec!["Lee".to_string(), "Sam".to_string()]);
        assert!(lee_rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_keep_the_sender_connected() {
        let (_store, router) = setup().await;
        let a = principal("Ana");
        let (a_id, _a_rx) = join(&router, &a).await;
        let (_, mut b_rx) = join(&router, &principal("Ben")).await;

        assert_eq!(router.handle_text(a_id, &a, "{not json").await, Flow::Continue);
        assert_eq!(
            router.handle_text(a_id, &a, r#"{"type":"dance"}"#).await,
            Flow::Continue
        );
        settle(&router).await;

        assert!(b_rx.try_recv().is_none());
        assert_eq!(router.hub().snapshot().await.unwrap().connections.len(), 2);
    }

    #[tokio::test]
    async fn leaving_disconnects_and_updates_the_roster() {
        let (_store, router) = setup().await;
        let a = principal("Ana");
        let (a_id, mut a_rx) = join(&router, &a).await;
        let (_, mut b_rx) = join(&router, &principal("Ben")).await;

        let flow = router
            .handle_text(a_id, &a, r#"{"type":"user_disconnected","username":"Ana"}"#)
            .await;
        assert_eq!(flow, Flow::Disconnect);
        settle(&router).await;

        assert_eq!(
            &*b_rx.try_recv().unwrap(),
            r#"{"type":"user_list","usernames":["Ben"]}"#
        );
        let closed = tokio::time::timeout(Duration::from_secs(1), a_rx.recv())
            .await
            .unwrap();
        assert!(closed.is_none());
    }

    #[tokio::test]
    async fn order_sync_persists_and_broadcasts_to_all() {
        let (store, router) = setup().await;
        let a = principal("Ana");
        let (a_id, mut a_rx) = join(&router, &a).await;
        let (_, mut b_rx) = join(&router, &principal("Ben")).await;

        let text = format!(
            r#"{{"type":"order_sync","updates":[{{"itemName":"Fries","price":3.5,"quantityDelta":2,"addedByUserId":"{}"}}]}}"#,
            a.user_id
        );
        router.handle_text(a_id, &a, &text).await;
        settle(&router).await;

        let lines = store
            .list_order_lines(&TableCode::new("rout0001"))
            .await
            .unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].price, Price::from_cents(350));

        for rx in [&mut a_rx, &mut b_rx] {
            let event = json(&rx.try_recv().unwrap());
            assert_eq!(event["type"], "order_synced");
            assert_eq!(event["username"], "Ana");
        }
    }

    #[tokio::test]
    async fn failed_order_sync_reports_to_sender_only() {
        let (_store, router) = setup().await;
        let a = principal("Ana");
        let (a_id, mut a_rx) = join(&router, &a).await;
        let (_, mut b_rx) = join(&router, &principal("Ben")).await;

        let text = format!(
            r#"{{"type":"order_sync","updates":[
                {{"itemName":"Tea","price":2,"quantityDelta":1,"addedByUserId":"{0}"}},
                {{"itemName":"tea","price":2,"quantityDelta":{1},"addedByUserId":"{0}"}}
            ]}}"#,
            a.user_id,
            i64::MAX
        );
        router.handle_text(a_id, &a, &text).await;
        settle(&router).await;

        assert_eq!(json(&a_rx.try_recv().unwrap())["type"], "error");
        assert!(b_rx.try_recv().is_none());
    }
}

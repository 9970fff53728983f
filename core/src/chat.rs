//! Chat streams for ride and support channels
//!
//! Outgoing messages appear immediately with a temporary id (client clock in
//! milliseconds) and are replaced by the server copy once the backend
//! confirms them. Echoes of the same message are de-duplicated by id, or by
//! identical created-at and content.

use crate::api::{ChatDraft, DriverApi};
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::events::{ClientEvent, OutgoingMessage};
use crate::models::{ChannelId, ChatMessage, MessageId, MessageStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

// ============================================================================
// History
// ============================================================================

/// Ordered, de-duplicated message list for one channel
#[derive(Debug, Clone, Default)]
pub struct ChatHistory {
    messages: Vec<ChatMessage>,
    /// Temporary ids already replaced by a confirmed copy
    retired: HashSet<MessageId>,
}

impl ChatHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&ChatMessage> {
        self.messages.iter().find(|m| m.id == id)
    }

    /// Insert unless already present. Returns whether it was added.
    pub fn merge(&mut self, message: ChatMessage) -> bool {
        if self.retired.contains(&message.id)
            || self.messages.iter().any(|m| m.is_same_as(&message))
        {
            return false;
        }
        self.insert_sorted(message);
        true
    }

    pub fn merge_all(&mut self, messages: impl IntoIterator<Item = ChatMessage>) -> usize {
        messages
            .into_iter()
            .map(|m| self.merge(m))
            .filter(|added| *added)
            .count()
    }

    pub fn push_optimistic(&mut self, mut message: ChatMessage) {
        message.status = MessageStatus::Pending;
        self.insert_sorted(message);
    }

    /// Replace the optimistic entry `temp_id` with the server copy
    pub fn confirm(&mut self, temp_id: MessageId, mut confirmed: ChatMessage) {
        if confirmed.id != temp_id {
            self.retired.insert(temp_id);
        }
        self.messages.retain(|m| m.id != temp_id);

        if let Some(existing) = self.messages.iter_mut().find(|m| m.id == confirmed.id) {
            // Server echo arrived before the REST response
            existing.status = MessageStatus::Sent;
            return;
        }
        confirmed.status = MessageStatus::Sent;
        self.insert_sorted(confirmed);
    }

    pub fn mark_sent(&mut self, id: MessageId) {
        self.set_status(id, MessageStatus::Sent);
    }

    pub fn mark_failed(&mut self, id: MessageId) {
        self.set_status(id, MessageStatus::Failed);
    }

    fn set_status(&mut self, id: MessageId, status: MessageStatus) {
        if let Some(message) = self.messages.iter_mut().find(|m| m.id == id) {
            message.status = status;
        }
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let key = (message.created_at, message.id);
        let index = self
            .messages
            .partition_point(|m| (m.created_at, m.id) <= key);
        self.messages.insert(index, message);
    }
}

// ============================================================================
// Stream
// ============================================================================

struct StreamInner {
    channel: ChannelId,
    sender_id: String,
    receiver_id: Option<String>,
    api: Arc<dyn DriverApi>,
    connection: Connection,
    history: Mutex<ChatHistory>,
    last_temp_id: AtomicI64,
}

/// One chat channel; clones share the same history
#[derive(Clone)]
pub struct ChatStream {
    inner: Arc<StreamInner>,
}

impl ChatStream {
    pub fn new(
        channel: ChannelId,
        sender_id: impl Into<String>,
        receiver_id: Option<String>,
        api: Arc<dyn DriverApi>,
        connection: Connection,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                channel,
                sender_id: sender_id.into(),
                receiver_id,
                api,
                connection,
                history: Mutex::new(ChatHistory::new()),
                last_temp_id: AtomicI64::new(0),
            }),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.inner.channel
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.history.lock().messages().to_vec()
    }

    /// Fetch the stored conversation and merge it into the local history
    pub async fn load_history(&self) -> Result<Vec<ChatMessage>> {
        let fetched = self.inner.api.chat_history(&self.inner.channel).await?;
        let mut history = self.inner.history.lock();
        let added = history.merge_all(fetched);
        log::debug!("Loaded {} messages for {}", added, self.inner.channel);
        Ok(history.messages().to_vec())
    }

    /// Pushed message for this channel. Returns whether it was new.
    pub fn on_incoming(&self, message: ChatMessage) -> bool {
        self.inner.history.lock().merge(message)
    }

    /// Send `content`. Nothing changes locally when the channel is down.
    pub async fn send(&self, content: &str) -> Result<ChatMessage> {
        let inner = &self.inner;
        let content = content.trim();
        if content.is_empty() {
            return Err(Error::EmptyMessage);
        }
        if !inner.connection.is_connected() {
            return Err(Error::NotConnected);
        }

        let created_at = Utc::now();
        let temp_id = self.next_temp_id(created_at);
        let (ride_id, ticket_id) = match &inner.channel {
            ChannelId::Ride(ride_id) => (Some(*ride_id), None),
            ChannelId::Support(ticket_id) => (None, Some(ticket_id.clone())),
        };
        inner.history.lock().push_optimistic(ChatMessage {
            id: temp_id,
            sender_id: inner.sender_id.clone(),
            receiver_id: inner.receiver_id.clone(),
            content: content.to_string(),
            created_at,
            ride_id,
            ticket_id,
            status: MessageStatus::Pending,
        });

        let draft = ChatDraft {
            sender_id: inner.sender_id.clone(),
            receiver_id: inner.receiver_id.clone(),
            content: content.to_string(),
            created_at,
        };
        let posted = match inner.api.post_chat_message(&inner.channel, &draft).await {
            Ok(posted) => posted,
            Err(e) => {
                log::warn!("Sending to {} failed: {}", inner.channel, e);
                inner.history.lock().mark_failed(temp_id);
                return Err(e);
            }
        };

        let confirmed_id = posted.message.as_ref().map_or(temp_id, |m| m.id);
        {
            let mut history = inner.history.lock();
            match posted.message {
                Some(confirmed) => history.confirm(temp_id, confirmed),
                None => history.mark_sent(temp_id),
            }
            if let Some(reply) = posted.bot_message {
                history.merge(reply);
            }
        }

        // Support tickets are broadcast by the backend itself
        if let ChannelId::Ride(ride_id) = inner.channel {
            let event = ClientEvent::SendMessage(OutgoingMessage {
                id: temp_id,
                ride_id,
                sender_id: draft.sender_id,
                receiver_id: draft.receiver_id,
                content: draft.content,
                created_at,
            });
            if let Err(e) = inner.connection.emit(&event) {
                log::warn!("Message relay for ride {} skipped: {}", ride_id, e);
            }
        }

        inner
            .history
            .lock()
            .get(confirmed_id)
            .cloned()
            .ok_or_else(|| Error::Storage(format!("message {} missing after send", confirmed_id.0)))
    }

    fn next_temp_id(&self, at: DateTime<Utc>) -> MessageId {
        let now = at.timestamp_millis();
        let previous = self
            .inner
            .last_temp_id
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        MessageId(now.max(previous + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PostedMessage;
    use crate::connection::ReconnectPolicy;
    use crate::events::ServerEvent;
    use crate::models::{Identity, RideId, TicketId};
    use crate::testing::{eventually, ApiCall, MemoryPeer, MemoryTransport, ScriptedApi};
    use chrono::TimeZone;

    fn message(id: i64, content: &str, second: u32) -> ChatMessage {
        ChatMessage {
            id: MessageId(id),
            sender_id: "rider-1".to_string(),
            receiver_id: Some("d1".to_string()),
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, second).unwrap(),
            ride_id: Some(RideId(4)),
            ticket_id: None,
            status: MessageStatus::Delivered,
        }
    }

    async fn connected() -> (Connection, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let connection = Connection::new("ws://test", ReconnectPolicy::default(), transport);
        connection.connect(&Identity::new("t", "d1")).unwrap();
        connection.wait_until_connected().await.unwrap();
        (connection, peer)
    }

    #[test]
    fn test_history_ordering_and_dedupe() {
        let mut history = ChatHistory::new();
        assert!(history.merge(message(3, "third", 3)));
        assert!(history.merge(message(1, "first", 1)));
        assert!(history.merge(message(2, "second", 2)));

        assert!(!history.merge(message(2, "second", 2)));
        // Same instant and content under another id is the same message
        assert!(!history.merge(message(99, "first", 1)));

        let ids: Vec<i64> = history.messages().iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn test_equal_timestamps_order_by_id() {
        let mut history = ChatHistory::new();
        history.merge(message(8, "b", 5));
        history.merge(message(7, "a", 5));
        let ids: Vec<i64> = history.messages().iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![7, 8]);
    }

    #[test]
    fn test_confirm_replaces_optimistic() {
        let mut history = ChatHistory::new();
        history.push_optimistic(message(1_700_000_000_000, "hi", 1));
        history.confirm(MessageId(1_700_000_000_000), message(42, "hi", 2));

        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].id, MessageId(42));
        assert_eq!(history.messages()[0].status, MessageStatus::Sent);

        // Late echo carrying the temporary id
        assert!(!history.merge(message(1_700_000_000_000, "hi", 1)));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_confirm_after_echo() {
        let mut history = ChatHistory::new();
        history.push_optimistic(message(1_700_000_000_000, "hi", 1));
        assert!(history.merge(message(42, "hi", 2)));
        history.confirm(MessageId(1_700_000_000_000), message(42, "hi", 2));

        assert_eq!(history.len(), 1);
        assert_eq!(history.messages()[0].status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_send_then_echo_keeps_one_entry() {
        let api = ScriptedApi::new();
        let (connection, peer) = connected().await;
        let stream = ChatStream::new(
            ChannelId::Ride(RideId(4)),
            "d1",
            Some("rider-1".to_string()),
            api.clone(),
            connection.clone(),
        );

        let sent = stream.send("On my way").await.unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(
            api.calls(),
            vec![ApiCall::PostChat(ChannelId::Ride(RideId(4)), "On my way".to_string())]
        );

        eventually(|| !peer.sent_named("send_message").is_empty()).await;
        let relayed = peer.sent_named("send_message");
        assert_eq!(relayed.len(), 1);
        assert_eq!(relayed[0]["data"]["id"], sent.id.0);
        assert_eq!(relayed[0]["data"]["receiverId"], "rider-1");

        // The server echoes the relayed payload back
        let echo: ServerEvent = serde_json::from_value(serde_json::json!({
            "event": "receive_message",
            "data": relayed[0]["data"].clone()
        }))
        .unwrap();
        if let ServerEvent::ReceiveMessage(message) = echo {
            assert!(!stream.on_incoming(message));
        } else {
            panic!("expected receive_message");
        }
        assert_eq!(stream.messages().len(), 1);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_uses_server_copy() {
        let api = ScriptedApi::new();
        *api.posted.lock() = PostedMessage {
            message: Some(message(42, "On my way", 2)),
            bot_message: None,
        };
        let (connection, _peer) = connected().await;
        let stream = ChatStream::new(
            ChannelId::Ride(RideId(4)),
            "d1",
            Some("rider-1".to_string()),
            api,
            connection.clone(),
        );

        let sent = stream.send("On my way").await.unwrap();
        assert_eq!(sent.id, MessageId(42));
        assert!(!stream.on_incoming(message(42, "On my way", 2)));
        assert_eq!(stream.messages().len(), 1);

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_send_while_disconnected_changes_nothing() {
        let api = ScriptedApi::new();
        let (transport, _peer) = MemoryTransport::pair();
        let connection = Connection::new("ws://test", ReconnectPolicy::default(), transport);
        let stream = ChatStream::new(ChannelId::Ride(RideId(4)), "d1", None, api.clone(), connection);

        assert!(matches!(stream.send("hello").await, Err(Error::NotConnected)));
        assert!(matches!(stream.send("   ").await, Err(Error::EmptyMessage)));
        assert!(stream.messages().is_empty());
        assert!(api.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_post_marks_message() {
        let api = ScriptedApi::new();
        api.fail_next(
            "post_chat_message",
            Error::Http {
                status: 500,
                message: "down".to_string(),
            },
        );
        let (connection, peer) = connected().await;
        let stream = ChatStream::new(ChannelId::Ride(RideId(4)), "d1", None, api, connection.clone());

        assert!(stream.send("hello").await.is_err());
        let messages = stream.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
        assert!(peer.sent_named("send_message").is_empty());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_support_send_appends_bot_reply() {
        let api = ScriptedApi::new();
        let ticket = TicketId("t-9".to_string());
        let mut reply = message(21, "We are looking into it", 30);
        reply.sender_id = "bot".to_string();
        reply.ride_id = None;
        reply.ticket_id = Some(ticket.clone());
        *api.posted.lock() = PostedMessage {
            message: None,
            bot_message: Some(reply),
        };

        let (connection, peer) = connected().await;
        let stream = ChatStream::new(ChannelId::Support(ticket), "d1", None, api, connection.clone());

        stream.send("Rider left an item").await.unwrap();
        let messages = stream.messages();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.sender_id == "bot"));
        assert!(peer.sent_named("send_message").is_empty());

        connection.disconnect().await;
    }

    #[tokio::test]
    async fn test_load_history_merges() {
        let api = ScriptedApi::new();
        *api.history.lock() = vec![message(2, "b", 2), message(1, "a", 1)];
        let (connection, _peer) = connected().await;
        let stream = ChatStream::new(ChannelId::Ride(RideId(4)), "d1", None, api, connection.clone());

        stream.on_incoming(message(3, "c", 3));
        let loaded = stream.load_history().await.unwrap();
        let ids: Vec<i64> = loaded.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        stream.load_history().await.unwrap();
        assert_eq!(stream.messages().len(), 3);

        connection.disconnect().await;
    }

    #[test]
    fn test_temp_ids_are_unique() {
        let api = ScriptedApi::new();
        let (transport, _peer) = MemoryTransport::pair();
        let connection = Connection::new("ws://test", ReconnectPolicy::default(), transport);
        let stream = ChatStream::new(ChannelId::Ride(RideId(4)), "d1", None, api, connection);

        let at = Utc::now();
        let first = stream.next_temp_id(at);
        let second = stream.next_temp_id(at);
        assert_eq!(first.0, at.timestamp_millis());
        assert_eq!(second.0, first.0 + 1);
    }
}

//! In-memory protocol client for tests and demos.
//!
//! [`MockClient`] records everything the bot sends and lets a test inject
//! inbound events once [`ProtocolClient::connect`] is running.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use syncbot_core::client::{InboundEvent, InboundSender, OutgoingMessage, ProtocolClient};
use syncbot_core::conversation::Conversation;
use syncbot_core::error::{ClientError, ClientResult};
use syncbot_core::user::User;

/// Id of the bot account of a default [`MockClient`].
pub const MOCK_BOT_ID: &str = "100000000000000000000";

pub struct MockClient {
    platform: String,
    self_user: User,
    sent: Mutex<Vec<OutgoingMessage>>,
    uploads: AtomicUsize,
    conversations: Mutex<Vec<Conversation>>,
    users: Mutex<BTreeMap<String, User>>,
    kicks: Mutex<Vec<(String, String)>>,
    fail_kicks: AtomicBool,
    inbound: Mutex<Option<InboundSender>>,
    stop: CancellationToken,
}

impl MockClient {
    pub fn new(platform: impl Into<String>) -> Self {
        let mut self_user = User::new(MOCK_BOT_ID, "Syncbot");
        self_user.is_self = true;
        self_user.is_definitive = true;
        Self {
            platform: platform.into(),
            self_user,
            sent: Mutex::new(Vec::new()),
            uploads: AtomicUsize::new(0),
            conversations: Mutex::new(Vec::new()),
            users: Mutex::new(BTreeMap::new()),
            kicks: Mutex::new(Vec::new()),
            fail_kicks: AtomicBool::new(false),
            inbound: Mutex::new(None),
            stop: CancellationToken::new(),
        }
    }

    /// A `hangouts` client with no conversations.
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new("hangouts"))
    }

    pub fn with_conversation(self, conv: Conversation) -> Self {
        self.conversations.lock().push(conv);
        self
    }

    pub fn with_user(self, user: User) -> Self {
        self.users.lock().insert(user.id.clone(), user);
        self
    }

    pub fn fail_kicks(&self, fail: bool) {
        self.fail_kicks.store(fail, Ordering::Relaxed);
    }

    /// Messages sent so far, in order.
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().clone()
    }

    pub fn take_sent(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::Relaxed)
    }

    pub fn kicks(&self) -> Vec<(String, String)> {
        self.kicks.lock().clone()
    }

    /// Delivers `event` to a running `connect`. Returns `false` when not
    /// connected.
    pub fn inject(&self, event: InboundEvent) -> bool {
        self.inbound
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    fn platform(&self) -> &str {
        &self.platform
    }

    fn self_user(&self) -> User {
        self.self_user.clone()
    }

    async fn connect(&self, inbound: InboundSender) -> ClientResult<()> {
        *self.inbound.lock() = Some(inbound);
        self.stop.cancelled().await;
        self.inbound.lock().take();
        Ok(())
    }

    async fn disconnect(&self) -> ClientResult<()> {
        self.stop.cancel();
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> ClientResult<()> {
        self.sent.lock().push(message);
        Ok(())
    }

    async fn upload_image(&self, _bytes: Arc<Vec<u8>>, filename: &str) -> ClientResult<String> {
        let n = self.uploads.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(format!("img-{n}-{filename}"))
    }

    async fn get_users(&self, ids: &[String]) -> ClientResult<Vec<User>> {
        let users = self.users.lock();
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn get_conversations(&self) -> ClientResult<Vec<Conversation>> {
        Ok(self.conversations.lock().clone())
    }

    async fn create_one_to_one(&self, user_id: &str) -> ClientResult<String> {
        if !self.users.lock().contains_key(user_id) {
            return Err(ClientError::Protocol {
                status: 404,
                reason: format!("unknown user {user_id}"),
            });
        }
        Ok(format!("dm-{user_id}"))
    }

    async fn kick(&self, conv_id: &str, user_id: &str) -> ClientResult<()> {
        if self.fail_kicks.load(Ordering::Relaxed) {
            return Err(ClientError::Protocol {
                status: 403,
                reason: "kick refused".to_string(),
            });
        }
        self.kicks.lock().push((conv_id.to_string(), user_id.to_string()));
        Ok(())
    }
}

//! A protocol client on stdin / stdout.
//!
//! Every line typed on stdin arrives as a message from the operator in the
//! `console` conversation; everything the bot sends is printed. Useful to try
//! commands and plugins without a chat service.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use syncbot_core::client::{InboundEvent, InboundSender, OutgoingMessage, ProtocolClient};
use syncbot_core::conversation::{ConvType, Conversation};
use syncbot_core::error::{ClientError, ClientResult};
use syncbot_core::event::ChatEvent;
use syncbot_core::format::{Segment, plain_text};
use syncbot_core::user::User;

pub const CONSOLE_PLATFORM: &str = "console";
pub const CONSOLE_CONV: &str = "console";
pub const CONSOLE_BOT_ID: &str = "000000000000000000001";
pub const CONSOLE_OPERATOR_ID: &str = "000000000000000000002";

pub struct ConsoleClient {
    operator: User,
    stop: Mutex<CancellationToken>,
}

impl ConsoleClient {
    pub fn new(operator_name: impl Into<String>) -> Self {
        Self {
            operator: User::new(CONSOLE_OPERATOR_ID, operator_name).definitive(),
            stop: Mutex::new(CancellationToken::new()),
        }
    }

    fn conversation(&self) -> Conversation {
        Conversation::new(CONSOLE_CONV, "Console", ConvType::OneToOne)
            .with_participants([CONSOLE_BOT_ID, CONSOLE_OPERATOR_ID])
    }

    fn message(&self, line: &str) -> InboundEvent {
        InboundEvent::Message(ChatEvent::new(
            CONSOLE_CONV,
            self.operator.clone(),
            vec![Segment::text(line)],
        ))
    }
}

#[async_trait]
impl ProtocolClient for ConsoleClient {
    fn platform(&self) -> &str {
        CONSOLE_PLATFORM
    }

    fn self_user(&self) -> User {
        let mut user = User::new(CONSOLE_BOT_ID, "Syncbot").definitive();
        user.is_self = true;
        user
    }

    async fn connect(&self, inbound: InboundSender) -> ClientResult<()> {
        let stop = {
            let mut stop = self.stop.lock();
            if stop.is_cancelled() {
                *stop = CancellationToken::new();
            }
            stop.clone()
        };
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                line = lines.next_line() => match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        if inbound.send(self.message(line.trim_end())).is_err() {
                            return Err(ClientError::NotConnected);
                        }
                    }
                    Ok(None) => {
                        debug!("stdin closed");
                        stop.cancelled().await;
                        return Ok(());
                    }
                    Err(e) => return Err(ClientError::Network(e.to_string())),
                },
            }
        }
    }

    async fn disconnect(&self) -> ClientResult<()> {
        self.stop.lock().cancel();
        Ok(())
    }

    async fn send_message(&self, message: OutgoingMessage) -> ClientResult<()> {
        let mut text = plain_text(&message.segments);
        if let Some(image) = &message.image_id {
            text.push_str(&format!(" [image {image}]"));
        }
        let line = format!("[{}] {text}\n", message.conv_id);
        let mut stdout = tokio::io::stdout();
        stdout
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Network(e.to_string()))?;
        stdout
            .flush()
            .await
            .map_err(|e| ClientError::Network(e.to_string()))
    }

    async fn upload_image(&self, _bytes: Arc<Vec<u8>>, filename: &str) -> ClientResult<String> {
        Ok(format!("console-{filename}"))
    }

    async fn get_users(&self, ids: &[String]) -> ClientResult<Vec<User>> {
        Ok(ids
            .iter()
            .filter_map(|id| match id.as_str() {
                CONSOLE_OPERATOR_ID => Some(self.operator.clone()),
                CONSOLE_BOT_ID => Some(self.self_user()),
                _ => None,
            })
            .collect())
    }

    async fn get_conversations(&self) -> ClientResult<Vec<Conversation>> {
        Ok(vec![self.conversation()])
    }

    async fn create_one_to_one(&self, user_id: &str) -> ClientResult<String> {
        if user_id == CONSOLE_OPERATOR_ID {
            Ok(CONSOLE_CONV.to_string())
        } else {
            Err(ClientError::Protocol {
                status: 404,
                reason: format!("unknown user {user_id}"),
            })
        }
    }

    async fn kick(&self, _conv_id: &str, _user_id: &str) -> ClientResult<()> {
        Err(ClientError::Unsupported("kick"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operator_is_the_only_contact() {
        let client = ConsoleClient::new("Operator");
        let ids = vec![CONSOLE_OPERATOR_ID.to_string(), "999".to_string()];
        let users = client.get_users(&ids).await.unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].full_name, "Operator");
        assert_eq!(client.create_one_to_one(CONSOLE_OPERATOR_ID).await.unwrap(), CONSOLE_CONV);
        assert!(client.create_one_to_one("999").await.is_err());
    }

    #[test]
    fn lines_become_operator_messages() {
        let client = ConsoleClient::new("Operator");
        let InboundEvent::Message(event) = client.message("/bot help") else {
            panic!("expected a message");
        };
        assert_eq!(event.conv_id, CONSOLE_CONV);
        assert_eq!(event.user.id, CONSOLE_OPERATOR_ID);
        assert_eq!(plain_text(&event.segments), "/bot help");
    }
}

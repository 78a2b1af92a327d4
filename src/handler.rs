//! Asynchronous server messages and their handler.

use crate::error::{ErrorFields, Result};
use crate::protocol::backend::{
    NoticeResponse, NotificationResponse, ParameterStatus, RawMessage, msg_type,
};

/// Asynchronous message from the server.
///
/// These can arrive at any time, including between tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncMessage {
    /// Notification from LISTEN/NOTIFY.
    Notification {
        /// PID of the notifying backend process
        pid: u32,
        /// Channel name
        channel: String,
        /// Notification payload
        payload: String,
    },

    /// Non-fatal notice/warning from server.
    Notice(ErrorFields),

    /// Server parameter value changed.
    ParameterChanged {
        /// Parameter name
        name: String,
        /// New value
        value: String,
    },
}

impl AsyncMessage {
    /// Parse an asynchronous message.
    ///
    /// Returns `None` for any other message type.
    pub fn parse(msg: &RawMessage<'_>) -> Result<Option<Self>> {
        let message = match msg.type_byte {
            msg_type::NOTICE_RESPONSE => {
                AsyncMessage::Notice(NoticeResponse::parse(msg.payload)?.fields)
            }
            msg_type::PARAMETER_STATUS => {
                let param = ParameterStatus::parse(msg.payload)?;
                AsyncMessage::ParameterChanged {
                    name: param.name.to_string(),
                    value: param.value.to_string(),
                }
            }
            msg_type::NOTIFICATION_RESPONSE => {
                let notification = NotificationResponse::parse(msg.payload)?;
                AsyncMessage::Notification {
                    pid: notification.pid,
                    channel: notification.channel.to_string(),
                    payload: notification.payload.to_string(),
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}

/// Receives asynchronous messages on the connection's execution context.
///
/// The handler runs inside the connection loop, so it should return quickly.
/// Closures `FnMut(&AsyncMessage)` implement this trait.
pub trait AsyncMessageHandler: Send {
    /// Called once per asynchronous message, in arrival order.
    fn handle(&mut self, message: &AsyncMessage);
}

impl<F> AsyncMessageHandler for F
where
    F: FnMut(&AsyncMessage) + Send,
{
    fn handle(&mut self, message: &AsyncMessage) {
        self(message)
    }
}

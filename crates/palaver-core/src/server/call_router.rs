//! Call signaling relay.
//!
//! The router keeps no call state. Each signal is looked up against
//! presence once and either pushed to the callee or bounced back to the
//! caller as `CALL_OFFLINE`.

use super::handle::ConnectionHandle;
use super::presence::PresenceRegistry;
use crate::error::{Error, Result};
use crate::protocol::{call_id_of, Frame, FrameType};
use std::sync::Arc;
use tracing::debug;

/// What happened to a routed signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Pushed to the callee.
    Delivered,
    /// Callee absent; the caller was sent `CALL_OFFLINE`.
    Offline,
}

/// Relays signaling frames between online users.
#[derive(Debug, Clone)]
pub struct CallRouter {
    presence: Arc<PresenceRegistry>,
}

impl CallRouter {
    /// Create a router over the given presence registry.
    pub fn new(presence: Arc<PresenceRegistry>) -> Self {
        Self { presence }
    }

    /// Route one signal from the authenticated user `from`.
    ///
    /// The frame's sender is overwritten with `from`. A push that fails
    /// because the callee went away mid-write counts as offline.
    pub async fn route(
        &self,
        from: &str,
        origin: &ConnectionHandle,
        mut frame: Frame,
    ) -> Result<RouteOutcome> {
        if !frame.frame_type.is_call_signal() || frame.frame_type == FrameType::CallOffline {
            return Err(Error::InvalidMessage(format!(
                "{} is not a routable call signal",
                frame.frame_type
            )));
        }

        frame.sender = from.to_string();

        if let Some(callee) = self.presence.lookup(&frame.recipient) {
            match callee.push(&frame).await {
                Ok(()) => {
                    debug!(
                        signal = %frame.frame_type,
                        from = %frame.sender,
                        to = %frame.recipient,
                        "Call signal relayed"
                    );
                    return Ok(RouteOutcome::Delivered);
                }
                Err(e) => {
                    debug!(to = %frame.recipient, error = %e, "Callee push failed, reporting offline");
                }
            }
        }

        let notice = Frame::new(
            FrameType::CallOffline,
            frame.recipient.as_str(),
            from,
            call_id_of(&frame),
        );
        origin.push(&notice).await?;
        Ok(RouteOutcome::Offline)
    }
}

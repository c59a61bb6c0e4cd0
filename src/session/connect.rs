// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::{atomic::Ordering, Arc};

use tokio::{pin, select};

use crate::channel::{ChannelEventLoop, TransportPollResult};
use crate::error::Error;

use super::{session_warn, Session};

/// This struct manages the task of connecting to the server. It will only make a single
/// attempt, so whatever is calling it is responsible for retries.
pub(super) struct SessionConnector {
    inner: Arc<Session>,
}

/// When the session connects to the server, this describes how that happened, whether a
/// new session was created, or an old session was reactivated.
#[derive(Debug, Clone)]
pub enum SessionConnectMode {
    /// A new session was created with the inner server assigned session id.
    NewSession(u32),
    /// An old session was reactivated with the inner server assigned session id.
    ReactivatedSession(u32),
}

impl SessionConnector {
    pub fn new(session: Arc<Session>) -> Self {
        Self { inner: session }
    }

    pub async fn try_connect(&self) -> Result<(ChannelEventLoop, SessionConnectMode), Error> {
        self.connect_and_activate().await
    }

    async fn connect_and_activate(
        &self,
    ) -> Result<(ChannelEventLoop, SessionConnectMode), Error> {
        let mut event_loop = self.inner.channel.connect_no_retry().await?;

        let activate_fut = self.ensure_and_activate_session();
        pin!(activate_fut);

        let res = loop {
            select! {
                r = event_loop.poll() => {
                    if let TransportPollResult::Closed(e) = r {
                        return Err(e.unwrap_or_else(|| {
                            Error::transport("connection closed during session activation")
                        }));
                    }
                },
                r = &mut activate_fut => break r,
            }
        };

        let mode = match res {
            Ok(mode) => mode,
            Err(e) => {
                self.inner.channel.close_channel().await;

                loop {
                    if matches!(event_loop.poll().await, TransportPollResult::Closed(_)) {
                        break;
                    }
                }

                return Err(e);
            }
        };

        drop(activate_fut);

        Ok((event_loop, mode))
    }

    async fn ensure_and_activate_session(&self) -> Result<SessionConnectMode, Error> {
        let is_new_session = self.inner.session_id.load(Ordering::Relaxed) == 0;

        if is_new_session {
            let session_id = self.inner.create_session().await?;
            self.inner.activate_session().await?;
            Ok(SessionConnectMode::NewSession(session_id))
        } else {
            // Re-activation of the existing session. If the server refuses, the session
            // is lost for good; a replacement session is the application's decision to
            // make.
            match self.inner.activate_session().await {
                Ok(()) => Ok(SessionConnectMode::ReactivatedSession(
                    self.inner.session_id(),
                )),
                Err(e) => {
                    session_warn!(self.inner, "Failed to reactivate session: {}", e);
                    Err(Error::SessionLost)
                }
            }
        }
    }
}

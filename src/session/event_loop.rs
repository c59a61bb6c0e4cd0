// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::sync::Arc;
use std::time::Instant;

use futures::{Stream, TryStreamExt};

use crate::channel::{ChannelEventLoop, TransportPollResult};
use crate::error::Error;
use crate::retry::{ExponentialBackoff, SessionRetryPolicy};

use super::{
    connect::{SessionConnectMode, SessionConnector},
    session::SessionState,
    session_warn, Session,
};

/// A list of possible events that happens while polling the session. The client can use
/// this list to monitor events such as disconnects, reconnect failures, etc.
#[derive(Debug)]
#[non_exhaustive]
pub enum SessionPollResult {
    /// A message was sent to or received from the server.
    Transport(TransportPollResult),
    /// Connection was lost with the inner [`Error`].
    ConnectionLost(Error),
    /// Reconnecting to the server failed with the inner [`Error`].
    ReconnectFailed(Error),
    /// Session was connected or reconnected, the mode is given by the inner
    /// [`SessionConnectMode`].
    Reconnected(SessionConnectMode),
    /// The session begins (re)connecting to the server.
    BeginConnect,
}

enum SessionEventLoopState {
    Connected(ChannelEventLoop),
    Connecting(SessionConnector, ExponentialBackoff, Instant, bool),
    Disconnected,
}

/// The session event loop drives the client. It must be polled for anything to happen at
/// all.
#[must_use = "The session event loop must be started for the session to work"]
pub struct SessionEventLoop {
    inner: Arc<Session>,
    retry: SessionRetryPolicy,
}

impl SessionEventLoop {
    pub(crate) fn new(inner: Arc<Session>, retry: SessionRetryPolicy) -> Self {
        Self { inner, retry }
    }

    /// Convenience method for running the session event loop until completion. This
    /// method returns once the session is closed manually, or after it fails to
    /// reconnect.
    pub async fn run(self) -> Result<(), Error> {
        let stream = self.enter();
        tokio::pin!(stream);
        loop {
            let r = stream.try_next().await;

            match r {
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
                _ => (),
            }
        }
    }

    /// Convenience method for running the session event loop until completion on a tokio
    /// task. The returned [`JoinHandle`](tokio::task::JoinHandle) terminates once the
    /// session is closed manually, or after it fails to reconnect.
    pub fn spawn(self) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::task::spawn(self.run())
    }

    /// Start the event loop, returning a stream that must be polled until it is closed.
    /// The stream returns `None` when the session is closed manually, or
    /// `Some(Err(Error))` when it fails to connect or reconnect.
    ///
    /// It yields events from normal session operation, which can be used to take
    /// specific actions based on changes to the session state.
    ///
    /// The very first connection attempt is never retried; its failure is returned
    /// directly. Reconnects after a loss of connection follow the retry policy, and a
    /// session that cannot be re-activated within the policy ends the stream with
    /// [`Error::SessionLost`].
    pub fn enter(self) -> impl Stream<Item = Result<SessionPollResult, Error>> {
        futures::stream::try_unfold(
            (self, SessionEventLoopState::Disconnected),
            |(slf, state)| async move {
                let (res, state) = match state {
                    SessionEventLoopState::Connected(mut c) => match c.poll().await {
                        TransportPollResult::Closed(None) => {
                            // A clean close this side did not ask for is still a loss.
                            if matches!(
                                slf.inner.state(),
                                SessionState::Closing | SessionState::Closed
                            ) {
                                return Ok(None);
                            }
                            session_warn!(slf.inner, "Secure channel closed unexpectedly");
                            set_state_unless_closing(&slf.inner, SessionState::Activating);
                            Ok((
                                SessionPollResult::ConnectionLost(Error::transport(
                                    "secure channel closed",
                                )),
                                SessionEventLoopState::Disconnected,
                            ))
                        }
                        TransportPollResult::Closed(Some(e)) => {
                            session_warn!(slf.inner, "Transport disconnected: {}", e);
                            set_state_unless_closing(&slf.inner, SessionState::Activating);
                            Ok((
                                SessionPollResult::ConnectionLost(e),
                                SessionEventLoopState::Disconnected,
                            ))
                        }
                        r => Ok((
                            SessionPollResult::Transport(r),
                            SessionEventLoopState::Connected(c),
                        )),
                    },
                    SessionEventLoopState::Disconnected => {
                        let connector = SessionConnector::new(slf.inner.clone());
                        let is_initial = slf.inner.session_id() == 0;

                        set_state_unless_closing(&slf.inner, SessionState::Activating);

                        Ok((
                            SessionPollResult::BeginConnect,
                            SessionEventLoopState::Connecting(
                                connector,
                                slf.retry.new_backoff(),
                                Instant::now(),
                                is_initial,
                            ),
                        ))
                    }
                    SessionEventLoopState::Connecting(connector, mut backoff, next_try, initial) => {
                        tokio::time::sleep_until(next_try.into()).await;

                        match connector.try_connect().await {
                            Ok((channel, mode)) => {
                                set_state_unless_closing(&slf.inner, SessionState::Active);
                                Ok((
                                    SessionPollResult::Reconnected(mode),
                                    SessionEventLoopState::Connected(channel),
                                ))
                            }
                            Err(e) => {
                                session_warn!(slf.inner, "Failed to connect to server: {}", e);
                                if initial {
                                    // The first connection attempt fails fast so the
                                    // application sees the underlying problem.
                                    let _ = slf.inner.state_watch_tx.send(SessionState::Closed);
                                    return Err(e);
                                }
                                if matches!(e, Error::SessionLost) {
                                    let _ = slf.inner.state_watch_tx.send(SessionState::Closed);
                                    return Err(Error::SessionLost);
                                }
                                match backoff.next() {
                                    Some(x) => Ok((
                                        SessionPollResult::ReconnectFailed(e),
                                        SessionEventLoopState::Connecting(
                                            connector,
                                            backoff,
                                            Instant::now() + x,
                                            false,
                                        ),
                                    )),
                                    None => {
                                        let _ =
                                            slf.inner.state_watch_tx.send(SessionState::Closed);
                                        Err(Error::SessionLost)
                                    }
                                }
                            }
                        }
                    }
                }?;

                Ok(Some((res, (slf, state))))
            },
        )
    }
}

/// State changes driven by the event loop never override a close in progress.
fn set_state_unless_closing(session: &Session, state: SessionState) {
    session.state_watch_tx.send_if_modified(|s| {
        if matches!(*s, SessionState::Closing | SessionState::Closed) || *s == state {
            false
        } else {
            *s = state;
            true
        }
    });
}

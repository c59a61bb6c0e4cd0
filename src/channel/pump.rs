// OPCUA for Rust
// SPDX-License-Identifier: MPL-2.0
// Copyright (C) 2017-2024 Adam Lock

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::Either;
use parking_lot::RwLock;

use crate::comms::message::{ErrorMessage, Frame, FrameHeader, MessageType};
use crate::comms::secure_channel::SecureChannel;
use crate::error::Error;
use crate::transport::{TransportReader, TransportWriter};

/// State of one pending request: where to deliver the response and when to give up.
pub(crate) struct MessageState {
    callback: tokio::sync::oneshot::Sender<Result<Frame, Error>>,
    deadline: Instant,
}

/// An outbound message queued by a requester. The pump assigns the request id and
/// sequence number at the moment the message is secured and written, which is what keeps
/// both strictly increasing in send order.
pub(crate) struct OutgoingMessage {
    pub message_type: MessageType,
    pub body: Vec<u8>,
    pub callback: Option<tokio::sync::oneshot::Sender<Result<Frame, Error>>>,
    pub deadline: Instant,
}

/// The correlation state of the conversation: the outgoing queue, the table of pending
/// requests and the request id counter.
pub(super) struct ConversationState {
    /// Channel for outgoing requests. Will only be polled if the number of inflight
    /// requests is below the limit.
    outgoing_recv: tokio::sync::mpsc::Receiver<OutgoingMessage>,
    /// State of pending requests
    message_states: HashMap<u32, MessageState>,
    /// Maximum number of inflight requests.
    max_inflight: usize,
    /// Secure channel
    pub(super) secure_channel: Arc<RwLock<SecureChannel>>,
    next_request_id: u32,
}

#[derive(Debug)]
pub enum TransportPollResult {
    OutgoingMessageSent,
    IncomingMessage,
    /// The channel is closed. `None` is a clean shutdown requested by this side.
    Closed(Option<Error>),
}

impl ConversationState {
    pub fn new(
        secure_channel: Arc<RwLock<SecureChannel>>,
        outgoing_recv: tokio::sync::mpsc::Receiver<OutgoingMessage>,
        max_inflight: usize,
    ) -> Self {
        Self {
            secure_channel,
            outgoing_recv,
            message_states: HashMap::new(),
            max_inflight,
            next_request_id: 0,
        }
    }

    /// Wait for an outgoing message. Will also check for timed out and abandoned
    /// requests.
    pub async fn wait_for_outgoing_message(&mut self) -> Option<(OutgoingMessage, u32)> {
        loop {
            // Check for any messages that have timed out, and get the time until the next
            // message times out
            let timeout_fut = match self.next_timeout() {
                Some(t) => Either::Left(tokio::time::sleep_until(t.into())),
                None => Either::Right(futures::future::pending::<()>()),
            };

            // Only listen for outgoing messages if the number of inflight messages is
            // below the limit.
            if self.max_inflight > self.message_states.len() {
                tokio::select! {
                    _ = timeout_fut => {
                        continue;
                    }
                    outgoing = self.outgoing_recv.recv() => {
                        let mut outgoing = outgoing?;
                        self.next_request_id = self.next_request_id.wrapping_add(1);
                        let request_id = self.next_request_id;
                        if let Some(callback) = outgoing.callback.take() {
                            self.message_states.insert(request_id, MessageState {
                                callback,
                                deadline: outgoing.deadline,
                            });
                        }
                        break Some((outgoing, request_id));
                    }
                }
            } else {
                timeout_fut.await;
            }
        }
    }

    /// Verifies an inbound message and routes it to the matching pending request.
    /// A response no requester is waiting for is discarded.
    pub fn handle_incoming_message(&mut self, data: &[u8]) -> Result<(), Error> {
        let frame = {
            let mut secure_channel = trace_write_lock!(self.secure_channel);
            secure_channel.verify_and_remove_security(data)?
        };

        if frame.header.message_type == MessageType::Error {
            let error = ErrorMessage::decode(&frame.body)
                .map(|e| e.reason)
                .unwrap_or_else(|_| "peer sent an undecodable error message".to_string());
            error!("Received an error message from the peer: {}", error);
            return Err(Error::transport(error));
        }

        let request_id = frame.header.request_id;
        // We do not care at all about incoming messages without a corresponding request.
        let Some(state) = self.message_states.remove(&request_id) else {
            debug!("Discarding response with unknown request id {}", request_id);
            return Ok(());
        };
        let _ = state.callback.send(Ok(frame));
        Ok(())
    }

    fn next_timeout(&mut self) -> Option<Instant> {
        let now = Instant::now();
        let mut next_timeout = None;
        let mut dead = Vec::new();
        for (id, state) in &self.message_states {
            // A closed callback means the requester stopped waiting, which cancels the
            // request. The response, if any, will be discarded on arrival.
            if state.deadline <= now || state.callback.is_closed() {
                dead.push(*id);
            } else {
                match &next_timeout {
                    Some(t) if *t > state.deadline => next_timeout = Some(state.deadline),
                    None => next_timeout = Some(state.deadline),
                    _ => {}
                }
            }
        }
        for id in dead {
            if let Some(state) = self.message_states.remove(&id) {
                debug!("Message {} timed out or was abandoned", id);
                let _ = state.callback.send(Err(Error::RequestTimeout));
            }
        }
        next_timeout
    }

    /// Close the conversation, aborting any pending requests. If `status` is `None`, the
    /// pending requests are terminated with a connection closed error, they didn't
    /// succeed after all.
    pub async fn close(&mut self, status: Option<Error>) -> Option<Error> {
        let request_status = status
            .clone()
            .unwrap_or_else(|| Error::transport("connection closed"));

        for (_, pending) in self.message_states.drain() {
            let _ = pending.callback.send(Err(request_status.clone()));
        }

        // Make sure we also send a bad status for any remaining messages in the queue.
        // Close the channel first.
        self.outgoing_recv.close();

        // recv is no longer blocking.
        while let Some(msg) = self.outgoing_recv.recv().await {
            if let Some(cb) = msg.callback {
                let _ = cb.send(Err(request_status.clone()));
            }
        }

        status
    }
}

#[derive(Debug, Clone)]
enum PumpCloseState {
    Open,
    Closing(Option<Error>),
    Closed(Option<Error>),
}

/// Drives one connection: waits for queued outgoing messages and inbound frames,
/// securing and sequencing on the way out and verifying and correlating on the way in.
/// The single send path here is the only writer of the outbound sequence counter.
pub struct ChannelEventLoop {
    state: ConversationState,
    reader: Box<dyn TransportReader>,
    writer: Box<dyn TransportWriter>,
    should_close: bool,
    closed: PumpCloseState,
}

impl ChannelEventLoop {
    pub(super) fn new(
        state: ConversationState,
        reader: Box<dyn TransportReader>,
        writer: Box<dyn TransportWriter>,
    ) -> Self {
        Self {
            state,
            reader,
            writer,
            should_close: false,
            closed: PumpCloseState::Open,
        }
    }

    fn handle_incoming_message(
        &mut self,
        incoming: Result<Vec<u8>, Error>,
    ) -> TransportPollResult {
        match incoming {
            Ok(data) => {
                if let Err(e) = self.state.handle_incoming_message(&data) {
                    TransportPollResult::Closed(Some(e))
                } else {
                    TransportPollResult::IncomingMessage
                }
            }
            Err(err) => {
                error!("Error reading from transport {:?}", err);
                TransportPollResult::Closed(Some(err))
            }
        }
    }

    /// Secures and writes one outgoing message. The write lock is held while the
    /// sequence number is taken and the message is secured, then released before the
    /// transport write.
    async fn send_outgoing(
        &mut self,
        outgoing: OutgoingMessage,
        request_id: u32,
    ) -> Result<(), Error> {
        let secured = {
            let mut secure_channel = trace_write_lock!(self.state.secure_channel);
            if outgoing.message_type == MessageType::Message
                && secure_channel.token_has_expired()
            {
                return Err(Error::ChannelExpired);
            }
            let sequence_number = secure_channel.next_sequence_number();
            let frame = Frame {
                header: FrameHeader::new(
                    outgoing.message_type,
                    secure_channel.channel_id(),
                    secure_channel.token_id(),
                    sequence_number,
                    request_id,
                ),
                body: outgoing.body,
            };
            secure_channel.apply_security(&frame)?
        };
        self.writer.send(&secured).await
    }

    async fn poll_inner(&mut self) -> TransportPollResult {
        if self.should_close {
            debug!("Writer is setting the connection state to finished(good)");
            return TransportPollResult::Closed(None);
        }

        // Wait for the next outgoing message or inbound frame, whichever comes first.
        tokio::select! {
            outgoing = self.state.wait_for_outgoing_message() => {
                let Some((outgoing, request_id)) = outgoing else {
                    return TransportPollResult::Closed(None);
                };
                if outgoing.message_type == MessageType::CloseSecureChannel {
                    self.should_close = true;
                    debug!("Writer is about to send a close channel message which means it should close in a moment");
                }
                match self.send_outgoing(outgoing, request_id).await {
                    Ok(()) => TransportPollResult::OutgoingMessageSent,
                    Err(e) => {
                        // A pending request for this id was registered above, close
                        // resolves it.
                        TransportPollResult::Closed(Some(e))
                    }
                }
            }
            incoming = self.reader.receive() => {
                self.handle_incoming_message(incoming)
            }
        }
    }

    /// Polls the event loop once. Cancel safe apart from a transport write in progress,
    /// which is abandoned; the request it carried times out like any other unanswered
    /// request.
    pub async fn poll(&mut self) -> TransportPollResult {
        // `close` can be called multiple times and will continue where it left off, so
        // keep calling it until it completes, and _then_ set the state to closed.
        match self.closed.clone() {
            PumpCloseState::Open => {}
            PumpCloseState::Closing(c) => {
                let r = self.state.close(c.clone()).await;
                self.writer.close().await;
                self.closed = PumpCloseState::Closed(c);
                return TransportPollResult::Closed(r);
            }
            PumpCloseState::Closed(c) => {
                return TransportPollResult::Closed(c);
            }
        }

        let r = self.poll_inner().await;
        if let TransportPollResult::Closed(status) = &r {
            self.closed = PumpCloseState::Closing(status.clone());
            let r = self.state.close(status.clone()).await;
            self.writer.close().await;
            self.closed = PumpCloseState::Closed(r);
        }
        r
    }
}

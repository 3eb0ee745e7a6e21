//! Request/response channel to a single-threaded GTP engine.
//!
//! Commands are dispatched strictly one at a time in submission order; the
//! engine's output is split into command responses (stdout, buffered until a
//! flush frame) and `tag:payload` telemetry (stderr). Every incoming frame
//! carries the session token the bridge saw last, and frames stamped with any
//! token other than the current one are dropped.

use gobanview_protocol::telemetry::Payload;
use gobanview_protocol::wire::{self, EngineFrame, Envelope, Reply};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("engine rejected the command: {0}")]
    Rejected(String),
    /// A newer command with the same verb replaced this one before dispatch.
    #[error("superseded by a newer command")]
    Superseded,
    #[error("discarded by a session reset")]
    Discarded,
    #[error("engine connection closed")]
    Disconnected,
}

pub type CommandResult = Result<String, CommandError>;
pub type Responder = oneshot::Sender<CommandResult>;

/// Resolves with the engine's response body.
#[derive(Debug)]
pub struct PendingReply {
    rx: oneshot::Receiver<CommandResult>,
}

impl PendingReply {
    pub fn pair() -> (Responder, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { rx })
    }
}

impl Future for PendingReply {
    type Output = CommandResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // A dropped responder means the command was thrown away unanswered.
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(CommandError::Discarded)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    AwaitingResponse,
}

struct PendingCommand {
    text: String,
    responder: Responder,
}

type TaggedHandler = Box<dyn FnMut(&Payload) + Send>;
type RawHandler = Box<dyn FnMut(&str) + Send>;
type FailureHandler = Box<dyn FnMut(&str, &str) + Send>;

pub struct CommandChannel {
    outbox: mpsc::UnboundedSender<Envelope>,
    /// Head is in flight while the state is `AwaitingResponse`.
    queue: VecDeque<PendingCommand>,
    state: ChannelState,
    token: String,
    buffer: Vec<String>,
    tagged: HashMap<String, Vec<TaggedHandler>>,
    raw: Vec<RawHandler>,
    failures: Vec<FailureHandler>,
}

impl CommandChannel {
    /// Outgoing envelopes are written to the returned receiver; whoever owns
    /// the transport forwards them.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Envelope>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        let channel = Self {
            outbox,
            queue: VecDeque::new(),
            state: ChannelState::Idle,
            token: fresh_token(),
            buffer: Vec::new(),
            tagged: HashMap::new(),
            raw: Vec::new(),
            failures: Vec::new(),
        };
        (channel, rx)
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Commands submitted but not yet answered, in-flight one included.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn send(&mut self, text: impl Into<String>) -> PendingReply {
        let (responder, reply) = PendingReply::pair();
        self.submit(text, responder);
        reply
    }

    pub fn submit(&mut self, text: impl Into<String>, responder: Responder) {
        self.queue.push_back(PendingCommand {
            text: text.into(),
            responder,
        });
        if self.state == ChannelState::Idle {
            self.dispatch_next();
        }
    }

    /// Like [`send`](Self::send), but replaces an undispatched queue tail
    /// that has the same verb. Only the verb is compared, not the arguments.
    pub fn send_coalesced(&mut self, text: impl Into<String>) -> PendingReply {
        let (responder, reply) = PendingReply::pair();
        self.submit_coalesced(text, responder);
        reply
    }

    pub fn submit_coalesced(&mut self, text: impl Into<String>, responder: Responder) {
        let text = text.into();
        let in_flight = usize::from(self.state == ChannelState::AwaitingResponse);
        let tail_undispatched = self.queue.len() > in_flight;
        let same_verb = self
            .queue
            .back()
            .is_some_and(|tail| wire::verb(&tail.text) == wire::verb(&text));
        if tail_undispatched && same_verb {
            if let Some(old) = self.queue.pop_back() {
                trace!(target: "gobanview.channel", old = %old.text, new = %text, "coalesced");
                let _ = old.responder.send(Err(CommandError::Superseded));
            }
        }
        self.submit(text, responder);
    }

    /// Registers a handler for `tag:payload` telemetry. Lines with a
    /// registered tag are not passed to raw-line handlers.
    pub fn on_tagged_data(&mut self, tag: impl Into<String>, handler: impl FnMut(&Payload) + Send + 'static) {
        self.tagged
            .entry(tag.into())
            .or_default()
            .push(Box::new(handler));
    }

    /// Registers a handler for every line no tagged handler claims.
    pub fn on_raw_line(&mut self, handler: impl FnMut(&str) + Send + 'static) {
        self.raw.push(Box::new(handler));
    }

    /// Registers a handler called with `(command, body)` whenever the engine
    /// answers a command with `?`, whoever submitted it.
    pub fn on_failure(&mut self, handler: impl FnMut(&str, &str) + Send + 'static) {
        self.failures.push(Box::new(handler));
    }

    /// Starts a new session: drops every queued command without answering
    /// it, rotates the token, and asks the engine to echo the new token once
    /// it has drained all earlier work. The reply resolves at that point.
    pub fn new_session(&mut self) -> PendingReply {
        let dropped = self.queue.len();
        self.queue.clear();
        self.buffer.clear();
        self.state = ChannelState::Idle;
        self.token = fresh_token();
        debug!(target: "gobanview.channel", token = %self.token, dropped, "new session");
        self.send(wire::new_token_command(&self.token))
    }

    /// Fails every queued command after the transport went away.
    pub fn disconnect(&mut self) {
        for pending in self.queue.drain(..) {
            let _ = pending.responder.send(Err(CommandError::Disconnected));
        }
        self.buffer.clear();
        self.state = ChannelState::Idle;
    }

    pub fn handle_envelope(&mut self, envelope: Envelope) {
        match envelope.engine_frame() {
            Some(Ok(frame)) => self.handle_frame(frame),
            Some(Err(e)) => {
                warn!(target: "gobanview.channel", error = %e, "undecodable engine frame");
            }
            None => {
                debug!(target: "gobanview.channel", event = %envelope.event, "ignoring event");
            }
        }
    }

    pub fn handle_frame(&mut self, frame: EngineFrame) {
        if frame.token != self.token {
            debug!(
                target: "gobanview.channel",
                stale = %frame.token,
                current = %self.token,
                "dropping frame from another session"
            );
            return;
        }
        if let Some(stdout) = frame.stdout {
            if stdout.is_empty() {
                self.flush();
            } else {
                self.buffer.push(stdout);
            }
        }
        if let Some(stderr) = frame.stderr {
            for line in stderr.lines() {
                self.route_line(line);
            }
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let text = self.buffer.join("\n");
        self.buffer.clear();
        match Reply::classify(&text) {
            Some(reply) => self.resolve(reply, &text),
            None => {
                for line in text.lines() {
                    self.route_line(line);
                }
            }
        }
    }

    fn resolve(&mut self, reply: Reply, text: &str) {
        if self.state != ChannelState::AwaitingResponse {
            warn!(target: "gobanview.channel", response = %text, "response with no command in flight");
            self.route_line(text);
            return;
        }
        let Some(head) = self.queue.pop_front() else {
            self.state = ChannelState::Idle;
            return;
        };
        let result = match reply {
            Reply::Success(body) => Ok(body),
            Reply::Failure(body) => {
                for handler in self.failures.iter_mut() {
                    handler(&head.text, &body);
                }
                Err(CommandError::Rejected(body))
            }
        };
        trace!(target: "gobanview.channel", command = %head.text, ok = result.is_ok(), "answered");
        let _ = head.responder.send(result);
        self.state = ChannelState::Idle;
        self.dispatch_next();
    }

    fn dispatch_next(&mut self) {
        let Some(head) = self.queue.front() else {
            return;
        };
        if self.outbox.send(Envelope::command(head.text.clone())).is_err() {
            warn!(target: "gobanview.channel", "outbox closed; failing queued commands");
            self.disconnect();
            return;
        }
        self.state = ChannelState::AwaitingResponse;
    }

    fn route_line(&mut self, line: &str) {
        if let Some((tag, rest)) = wire::split_tagged(line) {
            if let Some(handlers) = self.tagged.get_mut(tag) {
                let payload = Payload::parse(rest);
                for handler in handlers.iter_mut() {
                    handler(&payload);
                }
                return;
            }
        }
        for handler in self.raw.iter_mut() {
            handler(line);
        }
    }
}

fn fresh_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

//! The session runtime.
//!
//! One task owns the command channel, the position tree, the layout and the
//! renderers. It multiplexes the transport, requests from [`SessionHandle`]s
//! and the paint tick with `tokio::select!`, so none of that state is ever
//! shared or locked.

use crate::channel::{CommandChannel, CommandError, CommandResult, PendingReply, Responder};
use crate::config::{self, ClientConfig};
use crate::sink::{LogKind, LogSink};
use crate::transport::{TcpTransport, Transport, TransportError};
use anyhow::{anyhow, Context};
use gobanview_core::{
    Board, Broadcaster, LayoutEngine, NodeId, NodeUpdate, PositionTree, Renderer, SurfaceSize,
    TreeConfig, TreeError, Variation,
};
use gobanview_protocol::telemetry::tags;
use gobanview_protocol::{
    fields, AnalysisReport, Color, Envelope, Move, MoveParseError, Payload, PositionReport,
    RenderState,
};
use serde::Serialize;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

const REQUEST_BUFFER: usize = 64;

enum Telemetry {
    Position(Payload),
    Analysis(Payload),
    Raw(String),
    Failure { command: String, body: String },
}

enum Request {
    Command {
        text: String,
        coalesce: bool,
        responder: Responder,
    },
    Snapshot {
        reply: oneshot::Sender<TreeSnapshot>,
    },
    FullLine {
        node: Option<NodeId>,
        reply: oneshot::Sender<Option<Vec<LineEntry>>>,
    },
    NewGame {
        size: u8,
        reply: oneshot::Sender<Vec<(String, PendingReply)>>,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    #[serde(rename = "move")]
    pub mv: Option<String>,
    pub move_number: u32,
    pub main_line: bool,
    pub x: i32,
    pub y: i32,
    pub visits: Option<u64>,
}

/// The whole tree with layout coordinates, as the viewer API serves it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeSnapshot {
    pub board_size: u8,
    pub current: NodeId,
    pub halted: bool,
    pub surface: SurfaceSize,
    pub nodes: Vec<NodeView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LineEntry {
    pub id: NodeId,
    #[serde(rename = "move")]
    pub mv: Option<String>,
    pub move_number: u32,
}

/// Cheap, cloneable access to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<Request>,
}

impl SessionHandle {
    pub async fn send(&self, text: impl Into<String>) -> CommandResult {
        self.command(text.into(), false).await
    }

    /// Sends `text`, replacing a still-queued command with the same verb.
    pub async fn send_coalesced(&self, text: impl Into<String>) -> CommandResult {
        self.command(text.into(), true).await
    }

    async fn command(&self, text: String, coalesce: bool) -> CommandResult {
        let (responder, reply) = PendingReply::pair();
        let request = Request::Command {
            text,
            coalesce,
            responder,
        };
        if self.requests.send(request).await.is_err() {
            return Err(CommandError::Disconnected);
        }
        reply.await
    }

    pub async fn snapshot(&self) -> anyhow::Result<TreeSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Snapshot { reply }).await?;
        rx.await.map_err(|_| session_ended())
    }

    /// Root-to-leaf line through `node`, or through the current position.
    /// `None` when the node does not exist.
    pub async fn full_line(&self, node: Option<NodeId>) -> anyhow::Result<Option<Vec<LineEntry>>> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::FullLine { node, reply }).await?;
        rx.await.map_err(|_| session_ended())
    }

    /// Clears the tree and the engine's board and waits until the engine has
    /// accepted the new game.
    pub async fn new_game(&self, size: u8) -> anyhow::Result<()> {
        config::validate_board_size(size)?;
        let (reply, rx) = oneshot::channel();
        self.request(Request::NewGame { size, reply }).await?;
        let replies = rx.await.map_err(|_| session_ended())?;
        for (command, reply) in replies {
            reply
                .await
                .with_context(|| format!("new game: `{command}` failed"))?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        let _ = self.requests.send(Request::Shutdown).await;
    }

    async fn request(&self, request: Request) -> anyhow::Result<()> {
        self.requests
            .send(request)
            .await
            .map_err(|_| session_ended())
    }
}

fn session_ended() -> anyhow::Error {
    anyhow!("session has ended")
}

pub struct Session<T> {
    transport: T,
    channel: CommandChannel,
    outbox: mpsc::UnboundedReceiver<Envelope>,
    telemetry: mpsc::UnboundedReceiver<Telemetry>,
    requests: mpsc::Receiver<Request>,
    tree: PositionTree,
    layout: LayoutEngine,
    broadcaster: Broadcaster,
    current: NodeId,
    topology_dirty: bool,
    sink: Box<dyn LogSink>,
    config: ClientConfig,
}

/// Connects to the bridge at `config.engine_addr` and starts a session.
pub async fn connect(
    config: ClientConfig,
    renderers: Vec<Box<dyn Renderer>>,
    sink: Box<dyn LogSink>,
) -> anyhow::Result<(SessionHandle, JoinHandle<anyhow::Result<()>>)> {
    let transport = TcpTransport::connect(&config.engine_addr)
        .await
        .with_context(|| format!("connect to engine bridge at {}", config.engine_addr))?;
    Session::start(config, transport, renderers, sink).await
}

impl<T: Transport + 'static> Session<T> {
    pub fn new(
        config: ClientConfig,
        transport: T,
        renderers: Vec<Box<dyn Renderer>>,
        sink: Box<dyn LogSink>,
    ) -> (Self, SessionHandle) {
        let (mut channel, outbox) = CommandChannel::new();
        let (events, telemetry) = mpsc::unbounded_channel();

        let position = events.clone();
        channel.on_tagged_data(tags::POSITION, move |payload: &Payload| {
            let _ = position.send(Telemetry::Position(payload.clone()));
        });
        let analysis = events.clone();
        channel.on_tagged_data(tags::ANALYSIS, move |payload: &Payload| {
            let _ = analysis.send(Telemetry::Analysis(payload.clone()));
        });
        let failures = events.clone();
        channel.on_failure(move |command: &str, body: &str| {
            let _ = failures.send(Telemetry::Failure {
                command: command.to_string(),
                body: body.to_string(),
            });
        });
        channel.on_raw_line(move |line: &str| {
            let _ = events.send(Telemetry::Raw(line.to_string()));
        });

        let mut broadcaster = Broadcaster::new();
        for renderer in renderers {
            broadcaster.push(renderer);
        }

        let tree = PositionTree::new(config.tree_config());
        let mut layout = LayoutEngine::new(config.layout_config());
        layout.insert(&tree, tree.root());
        let current = tree.root();

        let (tx, requests) = mpsc::channel(REQUEST_BUFFER);
        let session = Self {
            transport,
            channel,
            outbox,
            telemetry,
            requests,
            tree,
            layout,
            broadcaster,
            current,
            topology_dirty: true,
            sink,
            config,
        };
        (session, SessionHandle { requests: tx })
    }

    /// Opens a fresh engine session, spawns the runtime and returns once the
    /// bridge has acknowledged the session token.
    pub async fn start(
        config: ClientConfig,
        transport: T,
        renderers: Vec<Box<dyn Renderer>>,
        sink: Box<dyn LogSink>,
    ) -> anyhow::Result<(SessionHandle, JoinHandle<anyhow::Result<()>>)> {
        let (mut session, handle) = Self::new(config, transport, renderers, sink);
        let ready = session.channel.new_session();
        let task = tokio::spawn(session.run());
        ready
            .await
            .context("engine bridge did not acknowledge the session")?;
        info!(target: "gobanview.session", "session ready");
        Ok((handle, task))
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut paint = tokio::time::interval(self.config.paint_interval());
        paint.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(target: "gobanview.session", "session loop started");

        let result = loop {
            tokio::select! {
                Some(envelope) = self.outbox.recv() => {
                    if let Err(e) = self.transport.send(&envelope).await {
                        break Err(anyhow::Error::new(e).context("send to engine bridge"));
                    }
                }
                incoming = self.transport.recv() => match incoming {
                    Some(Ok(envelope)) => {
                        self.channel.handle_envelope(envelope);
                        self.drain_telemetry();
                    }
                    Some(Err(TransportError::Codec(e))) => {
                        warn!(target: "gobanview.session", error = %e, "skipping undecodable envelope");
                    }
                    Some(Err(e)) => {
                        break Err(anyhow::Error::new(e).context("receive from engine bridge"));
                    }
                    None => {
                        info!(target: "gobanview.session", "engine bridge closed the connection");
                        break Ok(());
                    }
                },
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown) | None => {
                        let _ = self.transport.close().await;
                        break Ok(());
                    }
                    Some(request) => self.handle_request(request),
                },
                _ = paint.tick() => self.paint(),
            }
        };

        self.channel.disconnect();
        self.requests.close();
        while let Ok(request) = self.requests.try_recv() {
            if let Request::Command { responder, .. } = request {
                let _ = responder.send(Err(CommandError::Disconnected));
            }
        }
        debug!(target: "gobanview.session", "session loop exited");
        result
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Command {
                text,
                coalesce,
                responder,
            } => {
                if coalesce {
                    self.channel.submit_coalesced(text, responder);
                } else {
                    self.channel.submit(text, responder);
                }
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Request::FullLine { node, reply } => {
                let _ = reply.send(self.full_line(node.unwrap_or(self.current)));
            }
            Request::NewGame { size, reply } => {
                let _ = reply.send(self.new_game(size));
            }
            Request::Shutdown => {}
        }
    }

    fn drain_telemetry(&mut self) {
        while let Ok(event) = self.telemetry.try_recv() {
            match event {
                Telemetry::Position(payload) => self.integrate_position(&payload),
                Telemetry::Analysis(payload) => self.integrate_analysis(&payload),
                Telemetry::Raw(line) => self.sink.log(LogKind::Engine, &line),
                Telemetry::Failure { command, body } => {
                    self.sink.log(LogKind::Failure, &format!("{command}: {body}"))
                }
            }
        }
    }

    fn integrate_position(&mut self, payload: &Payload) {
        if self.tree.is_halted() {
            debug!(target: "gobanview.session", "tree halted; ignoring position");
            return;
        }
        let report: PositionReport = match payload.decode() {
            Ok(report) => report,
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "malformed position telemetry");
                return;
            }
        };
        let size = self.tree.board_size();
        let moves = match parse_moves(&report.moves, size) {
            Ok(moves) => moves,
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "position with an unreadable move");
                return;
            }
        };
        let board = match report.board.as_deref().map(|b| Board::parse(size, b)).transpose() {
            Ok(board) => board,
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "position with an unreadable board");
                return;
            }
        };

        match self.tree.ensure_path(&moves, board) {
            Ok(path) => {
                for id in &path.created {
                    self.layout.insert(&self.tree, *id);
                }
                if !path.created.is_empty() {
                    self.topology_dirty = true;
                }
                self.current = path.node;
                let state = self.tree.render_state(path.node);
                self.broadcaster.broadcast(&state);
            }
            Err(TreeError::Diverged { node }) => {
                error!(
                    target: "gobanview.session",
                    %node,
                    "engine and position tree disagree; ignoring telemetry until a new game"
                );
                self.sink.log(
                    LogKind::Error,
                    &format!("position {node} diverged from the engine; start a new game to resync"),
                );
            }
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "position rejected");
            }
        }
    }

    fn integrate_analysis(&mut self, payload: &Payload) {
        let report: AnalysisReport = match payload.decode() {
            Ok(report) => report,
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "malformed analysis telemetry");
                return;
            }
        };
        let size = self.tree.board_size();
        let (node, update) = match analysis_update(&self.tree, report, size) {
            Ok(Some(found)) => found,
            Ok(None) => {
                warn!(target: "gobanview.session", "analysis for a position the tree has not seen");
                return;
            }
            Err(e) => {
                warn!(target: "gobanview.session", error = %e, "analysis with an unreadable move");
                return;
            }
        };
        match self.tree.update(node, update) {
            Ok(changed) if node == self.current => {
                self.broadcaster.broadcast(&changed);
            }
            Ok(_) => {}
            Err(e) => {
                debug!(target: "gobanview.session", error = %e, "analysis not applied");
            }
        }
    }

    fn new_game(&mut self, size: u8) -> Vec<(String, PendingReply)> {
        self.tree.reset(TreeConfig {
            board_size: size,
            first_to_play: Color::Black,
        });
        self.layout.reset();
        self.layout.insert(&self.tree, self.tree.root());
        self.current = self.tree.root();
        self.topology_dirty = true;

        let mut replies = vec![("session".to_string(), self.channel.new_session())];
        for command in [
            format!("boardsize {size}"),
            format!("komi {}", self.config.komi),
            "clear_board".to_string(),
        ] {
            let reply = self.channel.send(command.clone());
            replies.push((command, reply));
        }

        let state = self.tree.render_state(self.current);
        self.broadcaster.broadcast(&state);
        info!(target: "gobanview.session", size, "new game");
        replies
    }

    fn paint(&mut self) {
        if self.layout.refresh(&self.tree).is_some() {
            self.topology_dirty = true;
        }
        if std::mem::take(&mut self.topology_dirty) {
            let state = RenderState::new().with(fields::TOPOLOGY, self.topology());
            self.broadcaster.broadcast(&state);
        }
        self.broadcaster.paint();
    }

    fn topology(&self) -> serde_json::Value {
        let surface = self.layout.surface();
        let nodes: Vec<serde_json::Value> = self
            .tree
            .iter()
            .filter_map(|node| {
                let point = self.layout.point(node.id())?;
                Some(serde_json::json!({
                    "id": node.id(),
                    "x": point.x,
                    "y": point.y,
                    "main": node.is_main_line(),
                }))
            })
            .collect();
        serde_json::json!({
            "width": surface.width,
            "height": surface.height,
            "nodes": nodes,
        })
    }

    fn snapshot(&mut self) -> TreeSnapshot {
        if self.layout.refresh(&self.tree).is_some() {
            self.topology_dirty = true;
        }
        let size = self.tree.board_size();
        let nodes = self
            .tree
            .iter()
            .map(|node| {
                let point = self.layout.point(node.id()).unwrap_or_default();
                NodeView {
                    id: node.id(),
                    parent: node.parent(),
                    mv: node.mv().map(|m| m.to_gtp(size)),
                    move_number: node.move_number(),
                    main_line: node.is_main_line(),
                    x: point.x,
                    y: point.y,
                    visits: node.stats().visits,
                }
            })
            .collect();
        TreeSnapshot {
            board_size: size,
            current: self.current,
            halted: self.tree.is_halted(),
            surface: self.layout.surface(),
            nodes,
        }
    }

    fn full_line(&self, id: NodeId) -> Option<Vec<LineEntry>> {
        self.tree.node(id)?;
        let size = self.tree.board_size();
        let line = self
            .tree
            .get_full_line(id)
            .into_iter()
            .filter_map(|n| self.tree.node(n))
            .map(|node| LineEntry {
                id: node.id(),
                mv: node.mv().map(|m| m.to_gtp(size)),
                move_number: node.move_number(),
            })
            .collect();
        Some(line)
    }
}

fn parse_moves(texts: &[String], size: u8) -> Result<Vec<Move>, MoveParseError> {
    texts.iter().map(|t| Move::parse_gtp(t, size)).collect()
}

fn parse_variations(
    variations: BTreeMap<String, Vec<String>>,
    size: u8,
) -> Result<Vec<Variation>, MoveParseError> {
    variations
        .into_iter()
        .map(|(lead, line)| {
            Ok(Variation {
                lead: Move::parse_gtp(&lead, size)?,
                line: parse_moves(&line, size)?,
            })
        })
        .collect()
}

/// Resolves the report's position and converts its statistics. `Ok(None)`
/// when the tree has no such position.
fn analysis_update(
    tree: &PositionTree,
    report: AnalysisReport,
    size: u8,
) -> Result<Option<(NodeId, NodeUpdate)>, MoveParseError> {
    let moves = parse_moves(&report.moves, size)?;
    let Some(node) = tree.follow(&moves) else {
        return Ok(None);
    };
    let update = NodeUpdate {
        visits: report.visits,
        value: report.value,
        child_moves: report
            .child_moves
            .map(|m| parse_moves(&m, size))
            .transpose()?,
        child_visits: report.child_visits,
        child_values: report.child_values,
        variations: report
            .variations
            .map(|v| parse_variations(v, size))
            .transpose()?,
    };
    Ok(Some((node, update)))
}

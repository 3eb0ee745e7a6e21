use super::*;
use crate::sink::MemorySink;
use crate::viewer::{self, AppState};
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderValue, Request, StatusCode};
use axum::Json;
use gobanview_core::Renderer;
use gobanview_protocol::{fields, EngineFrame, Envelope, FieldSet, RenderState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower::ServiceExt;

struct MockTransport {
    incoming: mpsc::UnboundedReceiver<Envelope>,
    sent: mpsc::UnboundedSender<Envelope>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        self.sent
            .send(envelope.clone())
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Option<Result<Envelope, TransportError>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Engine side of the mock link. Stamps frames with the last token it was
/// asked to echo, like the real bridge.
struct Bridge {
    to_client: mpsc::UnboundedSender<Envelope>,
    from_client: mpsc::UnboundedReceiver<Envelope>,
    token: String,
}

impl Bridge {
    async fn next_command(&mut self) -> String {
        let envelope = self.from_client.recv().await.expect("client sent a command");
        let text = envelope.command_text().expect("cmd envelope").to_string();
        if let Some(token) = text.strip_prefix("echo __NEW_TOKEN__ ") {
            self.token = token.to_string();
        }
        text
    }

    fn frame(&self, frame: EngineFrame) {
        self.to_client.send(Envelope::engine(&frame)).unwrap();
    }

    fn reply(&self, line: &str) {
        self.frame(EngineFrame::stdout(self.token.clone(), line));
        self.frame(EngineFrame::flush(self.token.clone()));
    }

    fn telemetry(&self, line: &str) {
        self.frame(EngineFrame::stderr(self.token.clone(), line));
    }

    /// Reads one command and answers it successfully; `echo` echoes.
    async fn answer(&mut self, body: &str) -> String {
        let command = self.next_command().await;
        match command.strip_prefix("echo ") {
            Some(echoed) => self.reply(&format!("= {echoed}")),
            None => self.reply(&format!("= {body}")),
        }
        command
    }
}

#[derive(Clone, Default)]
struct Seen {
    updates: Arc<Mutex<Vec<FieldSet>>>,
    draws: Arc<AtomicUsize>,
}

impl Seen {
    fn saw(&self, field: &str) -> bool {
        self.updates.lock().unwrap().iter().any(|f| f.contains(field))
    }
}

struct Recorder(Seen);

impl Renderer for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn update(&mut self, fields: &FieldSet, _state: &RenderState) -> bool {
        self.0.updates.lock().unwrap().push(fields.clone());
        true
    }

    fn draw(&mut self) {
        self.0.draws.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    session: SessionHandle,
    task: JoinHandle<anyhow::Result<()>>,
    bridge: Bridge,
    sink: MemorySink,
    seen: Seen,
}

async fn start() -> Harness {
    let (to_client, incoming) = mpsc::unbounded_channel();
    let (sent, from_client) = mpsc::unbounded_channel();
    let mut bridge = Bridge {
        to_client,
        from_client,
        token: String::new(),
    };
    let sink = MemorySink::new();
    let seen = Seen::default();
    let config = ClientConfig {
        board_size: 9,
        viewer_addr: None,
        ..ClientConfig::default()
    };
    let starting = tokio::spawn(Session::start(
        config,
        MockTransport { incoming, sent },
        vec![Box::new(Recorder(seen.clone()))],
        Box::new(sink.clone()),
    ));
    let handshake = bridge.answer("").await;
    assert!(handshake.starts_with("echo __NEW_TOKEN__ "));
    let (session, task) = starting.await.unwrap().unwrap();
    Harness {
        session,
        task,
        bridge,
        sink,
        seen,
    }
}

/// Round-trips a command so that every frame sent before it has been handled.
async fn settle(h: &mut Harness) {
    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.send("protocol_version").await });
    assert_eq!(h.bridge.answer("2").await, "protocol_version");
    assert_eq!(pending.await.unwrap(), Ok("2".to_string()));
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn board_9x9(stones: &[(usize, char)]) -> String {
    let mut cells = vec!['.'; 81];
    for (index, stone) in stones {
        cells[*index] = *stone;
    }
    cells.into_iter().collect()
}

#[tokio::test]
async fn command_round_trip() {
    let mut h = start().await;
    let session = h.session.clone();
    let reply = tokio::spawn(async move { session.send("name").await });
    assert_eq!(h.bridge.answer("KataGo").await, "name");
    assert_eq!(reply.await.unwrap(), Ok("KataGo".to_string()));

    let session = h.session.clone();
    let reply = tokio::spawn(async move { session.send("frobnicate").await });
    assert_eq!(h.bridge.next_command().await, "frobnicate");
    h.bridge.reply("? unknown command");
    assert_eq!(
        reply.await.unwrap(),
        Err(CommandError::Rejected("unknown command".to_string()))
    );
}

#[tokio::test]
async fn position_telemetry_builds_tree_and_layout() {
    let mut h = start().await;
    // E5 is row 4, column 4 on a 9x9 board.
    let after_e5 = board_9x9(&[(40, 'X')]);
    h.bridge.telemetry(&format!(
        r#"position:{{"moves":["E5"],"board":"{after_e5}"}}"#
    ));
    h.bridge.telemetry(r#"position:{"moves":["E5","C3"]}"#);
    h.bridge.telemetry(r#"position:{"moves":["E5","G7"]}"#);
    settle(&mut h).await;

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.board_size, 9);
    assert_eq!(snapshot.nodes.len(), 4);
    assert_eq!(snapshot.current, gobanview_core::NodeId::from_index(3));

    let n1 = &snapshot.nodes[1];
    let n2 = &snapshot.nodes[2];
    let n3 = &snapshot.nodes[3];
    assert_eq!(n1.mv.as_deref(), Some("E5"));
    assert_eq!(n2.mv.as_deref(), Some("C3"));
    assert_eq!(n3.mv.as_deref(), Some("G7"));
    assert_eq!(n1.x, n2.x);
    assert!(n3.x > n2.x);
    assert_eq!(n2.y, n3.y);
    assert!(n1.main_line && n2.main_line && !n3.main_line);
    assert!(snapshot.surface.width > n3.x);

    eventually(|| h.seen.saw(fields::TOPOLOGY) && h.seen.draws.load(Ordering::SeqCst) > 0).await;
    assert!(h.seen.saw(fields::STONES));
    assert!(h.seen.saw(fields::CURRENT));
}

#[tokio::test]
async fn analysis_updates_only_reach_renderers_for_the_current_position() {
    let mut h = start().await;
    h.bridge.telemetry(r#"position:{"moves":["E5"]}"#);
    h.bridge.telemetry(r#"position:{"moves":["E5","C3"]}"#);
    h.bridge.telemetry(r#"analysis:{"moves":["E5"],"visits":40}"#);
    settle(&mut h).await;
    assert!(!h.seen.saw(fields::VISITS));

    h.bridge.telemetry(
        r#"analysis:{"moves":["E5","C3"],"visits":120,"childMoves":["D4","F6"],"childVisits":[90,30]}"#,
    );
    h.bridge.telemetry(r#"analysis:{"moves":["A1","A2"],"visits":1}"#);
    settle(&mut h).await;
    assert!(h.seen.saw(fields::VISITS));
    assert!(h.seen.saw(fields::CHILD_VISITS));

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.nodes[1].visits, Some(40));
    assert_eq!(snapshot.nodes[2].visits, Some(120));
    assert_eq!(snapshot.nodes.len(), 3);
}

#[tokio::test]
async fn untagged_engine_output_goes_to_the_transcript() {
    let mut h = start().await;
    h.bridge.telemetry("NN eval: 0.52\nwinrate:0.48");
    settle(&mut h).await;
    assert_eq!(
        h.sink.entries(),
        vec![
            (LogKind::Engine, "NN eval: 0.52".to_string()),
            (LogKind::Engine, "winrate:0.48".to_string()),
        ]
    );
}

#[tokio::test]
async fn diverged_position_halts_until_new_game() {
    let mut h = start().await;
    h.bridge.telemetry(&format!(
        r#"position:{{"moves":["E5"],"board":"{}"}}"#,
        board_9x9(&[(40, 'X')])
    ));
    h.bridge.telemetry(&format!(
        r#"position:{{"moves":["E5"],"board":"{}"}}"#,
        board_9x9(&[(40, 'O')])
    ));
    h.bridge.telemetry(r#"position:{"moves":["E5","C3"]}"#);
    settle(&mut h).await;

    let snapshot = h.session.snapshot().await.unwrap();
    assert!(snapshot.halted);
    assert_eq!(snapshot.nodes.len(), 2);
    assert!(h
        .sink
        .entries()
        .iter()
        .any(|(kind, text)| *kind == LogKind::Error && text.contains("diverged")));

    let session = h.session.clone();
    let new_game = tokio::spawn(async move { session.new_game(9).await });
    assert!(h.bridge.answer("").await.starts_with("echo __NEW_TOKEN__ "));
    assert_eq!(h.bridge.answer("").await, "boardsize 9");
    assert_eq!(h.bridge.answer("").await, "komi 7.5");
    assert_eq!(h.bridge.answer("").await, "clear_board");
    new_game.await.unwrap().unwrap();

    let snapshot = h.session.snapshot().await.unwrap();
    assert!(!snapshot.halted);
    assert_eq!(snapshot.nodes.len(), 1);
}

#[tokio::test]
async fn new_game_ignores_output_of_the_previous_session() {
    let mut h = start().await;
    h.bridge.telemetry(r#"position:{"moves":["E5"]}"#);
    settle(&mut h).await;
    let old_token = h.bridge.token.clone();

    let session = h.session.clone();
    let new_game = tokio::spawn(async move { session.new_game(13).await });
    let echo = h.bridge.next_command().await;
    assert!(echo.starts_with("echo __NEW_TOKEN__ "));
    assert_ne!(h.bridge.token, old_token);

    // Still draining work from before the reset.
    h.frame_with_token(&old_token, r#"position:{"moves":["E5","C3"]}"#);
    h.bridge.reply(&format!("= {}", &echo["echo ".len()..]));
    assert_eq!(h.bridge.answer("").await, "boardsize 13");
    assert_eq!(h.bridge.answer("").await, "komi 7.5");
    assert_eq!(h.bridge.answer("").await, "clear_board");
    new_game.await.unwrap().unwrap();

    let snapshot = h.session.snapshot().await.unwrap();
    assert_eq!(snapshot.board_size, 13);
    assert_eq!(snapshot.nodes.len(), 1);
}

impl Harness {
    fn frame_with_token(&self, token: &str, line: &str) {
        self.bridge.frame(EngineFrame::stderr(token, line));
    }
}

#[tokio::test]
async fn new_game_rejects_unsupported_sizes() {
    let h = start().await;
    assert!(h.session.new_game(1).await.is_err());
    assert!(h.session.new_game(26).await.is_err());
}

#[tokio::test]
async fn full_line_follows_the_main_line_below_a_node() {
    let mut h = start().await;
    for moves in [r#"["E5"]"#, r#"["E5","C3"]"#, r#"["E5","C3","D4"]"#, r#"["E5","G7"]"#] {
        h.bridge.telemetry(&format!(r#"position:{{"moves":{moves}}}"#));
    }
    settle(&mut h).await;

    let line = h
        .session
        .full_line(Some(gobanview_core::NodeId::from_index(1)))
        .await
        .unwrap()
        .unwrap();
    let moves: Vec<_> = line.iter().map(|e| e.mv.as_deref()).collect();
    assert_eq!(moves, [None, Some("E5"), Some("C3"), Some("D4")]);

    // Current position is the G7 variation.
    let line = h.session.full_line(None).await.unwrap().unwrap();
    let moves: Vec<_> = line.iter().map(|e| e.mv.as_deref()).collect();
    assert_eq!(moves, [None, Some("E5"), Some("G7")]);

    let missing = h
        .session
        .full_line(Some(gobanview_core::NodeId::from_index(42)))
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn bridge_disconnect_fails_pending_commands() {
    let mut h = start().await;
    let session = h.session.clone();
    let reply = tokio::spawn(async move { session.send("genmove b").await });
    assert_eq!(h.bridge.next_command().await, "genmove b");
    drop(h.bridge);

    assert_eq!(reply.await.unwrap(), Err(CommandError::Disconnected));
    h.task.await.unwrap().unwrap();
    assert_eq!(h.session.send("name").await, Err(CommandError::Disconnected));
    assert!(h.session.snapshot().await.is_err());
}

#[tokio::test]
async fn shutdown_stops_the_session_loop() {
    let h = start().await;
    h.session.shutdown().await;
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn viewer_tree_and_line_handlers() {
    let mut h = start().await;
    h.bridge.telemetry(r#"position:{"moves":["E5"]}"#);
    h.bridge.telemetry(r#"position:{"moves":["E5","C3"]}"#);
    settle(&mut h).await;
    let state = Arc::new(AppState {
        session: h.session.clone(),
    });

    let Json(snapshot) = viewer::tree(State(state.clone())).await.unwrap();
    assert_eq!(snapshot.nodes.len(), 3);

    let Json(line) = viewer::line(State(state.clone()), Path(2)).await.unwrap();
    assert_eq!(line.len(), 3);
    assert_eq!(line[2].move_number, 2);

    let Json(current) = viewer::current_line(State(state.clone())).await.unwrap();
    assert_eq!(current, line);

    let (status, _) = viewer::line(State(state), Path(99)).await.unwrap_err();
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn viewer_command_handler_reports_engine_answers() {
    let mut h = start().await;
    let state = Arc::new(AppState {
        session: h.session.clone(),
    });

    let call = tokio::spawn(viewer::command(
        State(state.clone()),
        Json(viewer::CommandInput {
            command: "  name ".to_string(),
            coalesce: false,
        }),
    ));
    assert_eq!(h.bridge.answer("KataGo").await, "name");
    let Json(output) = call.await.unwrap().unwrap();
    assert_eq!(
        output,
        viewer::CommandOutput {
            ok: true,
            body: "KataGo".to_string(),
            superseded: false,
        }
    );

    let call = tokio::spawn(viewer::command(
        State(state.clone()),
        Json(viewer::CommandInput {
            command: "play b Z99".to_string(),
            coalesce: true,
        }),
    ));
    assert_eq!(h.bridge.next_command().await, "play b Z99");
    h.bridge.reply("? illegal move");
    let Json(output) = call.await.unwrap().unwrap();
    assert!(!output.ok);
    assert_eq!(output.body, "illegal move");
    settle(&mut h).await;
    assert_eq!(
        h.sink.entries(),
        vec![(LogKind::Failure, "play b Z99: illegal move".to_string())]
    );

    let (status, _) = viewer::command(
        State(state),
        Json(viewer::CommandInput {
            command: "   ".to_string(),
            coalesce: false,
        }),
    )
    .await
    .unwrap_err();
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

fn request_from(peer: &str, uri: &str) -> Request<axum::body::Body> {
    let mut request = Request::builder()
        .uri(uri)
        .body(axum::body::Body::empty())
        .unwrap();
    let peer: SocketAddr = peer.parse().unwrap();
    request
        .extensions_mut()
        .insert(axum::extract::ConnectInfo(peer));
    request
}

#[tokio::test]
async fn router_serves_loopback_and_forbids_others() {
    let h = start().await;
    let router = viewer::build_router(AppState {
        session: h.session.clone(),
    });

    let response = router
        .clone()
        .oneshot(request_from("127.0.0.1:50000", "/health"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&body[..], b"ok");

    let response = router
        .clone()
        .oneshot(request_from("[::1]:50000", "/api/tree"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let tree: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(tree["boardSize"], 9);
    assert_eq!(tree["nodes"][0]["move"], serde_json::Value::Null);

    for peer in ["8.8.8.8:50000", "100.100.1.2:50000", "192.168.1.10:50000"] {
        let response = router
            .clone()
            .oneshot(request_from(peer, "/api/tree"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "peer {peer}");
    }
}

#[test]
fn viewer_allows_only_local_origins_and_peers() {
    for origin in ["http://localhost:5173", "https://127.0.0.1", "http://localhost"] {
        assert!(viewer::is_allowed_local_origin(&HeaderValue::from_static(origin)));
    }
    for origin in [
        "http://localhost.evil.com",
        "https://example.com",
        "file://localhost",
        "null",
    ] {
        assert!(!viewer::is_allowed_local_origin(&HeaderValue::from_static(origin)));
    }

    assert!(viewer::is_allowed_peer_ip("127.0.0.1".parse().unwrap()));
    assert!(viewer::is_allowed_peer_ip("::1".parse().unwrap()));
    assert!(!viewer::is_allowed_peer_ip("100.64.0.1".parse().unwrap()));
    assert!(!viewer::is_allowed_peer_ip("100.100.1.2".parse().unwrap()));
    assert!(!viewer::is_allowed_peer_ip("192.168.1.10".parse().unwrap()));
}

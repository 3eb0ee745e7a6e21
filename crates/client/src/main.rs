use anyhow::Context;
use clap::Parser;
use gobanview_client::renderers::{BoardRenderer, CandidatesRenderer, StatsRenderer, TreeRenderer};
use gobanview_client::{connect, viewer, Cli, ClientConfig, LogKind, LogSink, SessionHandle, TranscriptSink};
use gobanview_core::Renderer;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::oneshot;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: Option<&str>) {
    let filter_layer = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));
    tracing_subscriber::fmt()
        .with_env_filter(filter_layer)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn stdout_renderers() -> Vec<Box<dyn Renderer>> {
    vec![
        Box::new(BoardRenderer::new(Box::new(std::io::stdout()))),
        Box::new(StatsRenderer::new(Box::new(std::io::stdout()))),
        Box::new(CandidatesRenderer::new(Box::new(std::io::stdout()), 5)),
        Box::new(TreeRenderer::new(Box::new(std::io::stdout()), 80)),
    ]
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = ClientConfig::resolve(cli)?;
    init_tracing(config.log_level.as_deref());
    info!(
        engine = %config.engine_addr,
        board_size = config.board_size,
        viewer = ?config.viewer_addr,
        "starting gobanview"
    );

    let board_size = config.board_size;
    let viewer_addr = config.viewer_addr;
    let sink = Box::new(TranscriptSink::new(std::io::stdout()));
    let (session, task) = connect(config, stdout_renderers(), sink).await?;
    session
        .new_game(board_size)
        .await
        .context("set up the engine's board")?;

    let (stop_viewer, viewer_stopped) = oneshot::channel::<()>();
    let viewer = viewer_addr.map(|addr| {
        let handle = session.clone();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = viewer_stopped.await;
            };
            if let Err(e) = viewer::serve(addr, handle, shutdown).await {
                warn!(error = %e, "viewer stopped");
            }
        })
    });

    tokio::select! {
        result = repl(&session, board_size) => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    let _ = stop_viewer.send(());
    if let Some(viewer) = viewer {
        let _ = viewer.await;
    }
    session.shutdown().await;
    task.await.context("session task panicked")?
}

async fn repl(session: &SessionHandle, board_size: u8) -> anyhow::Result<()> {
    let mut sink = TranscriptSink::new(std::io::stdout());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_whitespace().collect::<Vec<_>>().as_slice() {
            [":quit"] => break,
            [":new"] => new_game(session, &mut sink, board_size, None).await,
            [":new", size] => new_game(session, &mut sink, board_size, Some(*size)).await,
            [":line"] => match session.full_line(None).await? {
                Some(entries) => {
                    let moves: Vec<String> = entries.into_iter().filter_map(|e| e.mv).collect();
                    sink.log(LogKind::Response, &moves.join(" "));
                }
                None => sink.log(LogKind::Error, "no current position"),
            },
            _ => match session.send(line).await {
                Ok(body) => sink.log(LogKind::Response, &body),
                // The session already logged the engine's failure text.
                Err(gobanview_client::CommandError::Rejected(_)) => {}
                Err(e) => sink.log(LogKind::Error, &e.to_string()),
            },
        }
    }
    Ok(())
}

async fn new_game(
    session: &SessionHandle,
    sink: &mut dyn LogSink,
    default_size: u8,
    size: Option<&str>,
) {
    let size = match size.map(str::parse::<u8>).transpose() {
        Ok(size) => size.unwrap_or(default_size),
        Err(e) => {
            sink.log(LogKind::Error, &format!("bad board size: {e}"));
            return;
        }
    };
    match session.new_game(size).await {
        Ok(()) => sink.log(LogKind::Response, &format!("new {size}x{size} game")),
        Err(e) => sink.log(LogKind::Error, &format!("{e:#}")),
    }
}

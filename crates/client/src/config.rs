use anyhow::{bail, Context};
use clap::Parser;
use gobanview_core::{LayoutConfig, TreeConfig, MAX_SPACING};
use gobanview_protocol::moves::MAX_BOARD_SIZE;
use gobanview_protocol::Color;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_ENGINE_ADDR: &str = "127.0.0.1:39330";
pub const DEFAULT_VIEWER_ADDR: &str = "127.0.0.1:39333";
pub const DEFAULT_BOARD_SIZE: u8 = 19;
pub const DEFAULT_KOMI: f64 = 7.5;
pub const DEFAULT_PAINT_HZ: u32 = 60;

#[derive(Debug, Default, Parser)]
#[command(
    name = "gobanview",
    version,
    about = "Terminal viewer for a GTP engine behind a JSON-lines bridge"
)]
pub struct Cli {
    /// Engine bridge address.
    #[arg(long, env = "GOBANVIEW_ADDR")]
    pub addr: Option<String>,

    #[arg(long)]
    pub board_size: Option<u8>,

    #[arg(long)]
    pub komi: Option<f64>,

    /// Grid spacing of the variation tree layout.
    #[arg(long)]
    pub spacing: Option<i32>,

    /// Address of the local viewer HTTP API.
    #[arg(long, env = "GOBANVIEW_VIEWER_ADDR")]
    pub viewer_addr: Option<String>,

    /// Do not start the viewer HTTP API.
    #[arg(long, default_value_t = false)]
    pub no_viewer: bool,

    /// YAML config file. Defaults to ~/.gobanview/config.yaml when present.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// tracing filter, e.g. `debug` or `gobanview.channel=trace`. RUST_LOG wins.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Upper bound on renderer redraws per second.
    #[arg(long)]
    pub paint_hz: Option<u32>,
}

/// On-disk settings. Every field is optional; CLI flags take precedence.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub board_size: Option<u8>,
    pub komi: Option<f64>,
    pub spacing: Option<i32>,
    pub viewer_addr: Option<String>,
    pub paint_hz: Option<u32>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub engine_addr: String,
    pub board_size: u8,
    pub komi: f64,
    pub spacing: i32,
    pub viewer_addr: Option<SocketAddr>,
    pub paint_hz: u32,
    pub log_level: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            engine_addr: DEFAULT_ENGINE_ADDR.to_string(),
            board_size: DEFAULT_BOARD_SIZE,
            komi: DEFAULT_KOMI,
            spacing: 1,
            viewer_addr: None,
            paint_hz: DEFAULT_PAINT_HZ,
            log_level: None,
        }
    }
}

impl ClientConfig {
    /// CLI flags over the config file over defaults.
    pub fn resolve(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => match default_config_path() {
                Some(path) if path.exists() => FileConfig::load(&path)?,
                _ => FileConfig::default(),
            },
        };
        Self::from_parts(cli, file)
    }

    pub fn from_parts(cli: Cli, file: FileConfig) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let viewer_addr = if cli.no_viewer {
            None
        } else {
            let raw = cli
                .viewer_addr
                .or(file.viewer_addr)
                .unwrap_or_else(|| DEFAULT_VIEWER_ADDR.to_string());
            Some(
                raw.parse()
                    .with_context(|| format!("invalid viewer address: {raw}"))?,
            )
        };
        let config = Self {
            engine_addr: cli.addr.or(file.addr).unwrap_or(defaults.engine_addr),
            board_size: cli.board_size.or(file.board_size).unwrap_or(defaults.board_size),
            komi: cli.komi.or(file.komi).unwrap_or(defaults.komi),
            spacing: cli.spacing.or(file.spacing).unwrap_or(defaults.spacing),
            viewer_addr,
            paint_hz: cli.paint_hz.or(file.paint_hz).unwrap_or(defaults.paint_hz),
            log_level: cli.log_level.or(file.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        validate_board_size(self.board_size)?;
        if !(1..=MAX_SPACING).contains(&self.spacing) {
            bail!(
                "spacing must be within 1..={MAX_SPACING}, got {}",
                self.spacing
            );
        }
        if !(1..=240).contains(&self.paint_hz) {
            bail!("paint rate must be within 1..=240 Hz, got {}", self.paint_hz);
        }
        if !self.komi.is_finite() {
            bail!("komi must be a finite number");
        }
        Ok(())
    }

    pub fn paint_interval(&self) -> Duration {
        Duration::from_secs(1) / self.paint_hz.max(1)
    }

    pub fn tree_config(&self) -> TreeConfig {
        TreeConfig {
            board_size: self.board_size,
            first_to_play: Color::Black,
        }
    }

    pub fn layout_config(&self) -> LayoutConfig {
        LayoutConfig {
            spacing: self.spacing,
        }
    }
}

pub fn validate_board_size(size: u8) -> anyhow::Result<()> {
    if !(2..=MAX_BOARD_SIZE).contains(&size) {
        bail!("board size must be within 2..={MAX_BOARD_SIZE}, got {size}");
    }
    Ok(())
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".gobanview").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let file: FileConfig = serde_yaml::from_str(
            "addr: 10.0.0.2:4000\nboard_size: 13\nkomi: 6.5\npaint_hz: 30\n",
        )
        .unwrap();
        let cli = Cli {
            board_size: Some(9),
            ..Cli::default()
        };
        let config = ClientConfig::from_parts(cli, file).unwrap();
        assert_eq!(config.engine_addr, "10.0.0.2:4000");
        assert_eq!(config.board_size, 9);
        assert_eq!(config.komi, 6.5);
        assert_eq!(config.paint_hz, 30);
        assert_eq!(config.spacing, 1);
        assert_eq!(
            config.viewer_addr,
            Some(DEFAULT_VIEWER_ADDR.parse().unwrap())
        );
    }

    #[test]
    fn rejects_out_of_range_values() {
        for cli in [
            Cli {
                board_size: Some(1),
                ..Cli::default()
            },
            Cli {
                board_size: Some(26),
                ..Cli::default()
            },
            Cli {
                spacing: Some(0),
                ..Cli::default()
            },
            Cli {
                spacing: Some(MAX_SPACING + 1),
                ..Cli::default()
            },
            Cli {
                spacing: Some(i32::MAX / 2 + 1),
                ..Cli::default()
            },
            Cli {
                paint_hz: Some(0),
                ..Cli::default()
            },
            Cli {
                viewer_addr: Some("not an addr".to_string()),
                ..Cli::default()
            },
        ] {
            assert!(ClientConfig::from_parts(cli, FileConfig::default()).is_err());
        }
    }

    #[test]
    fn unknown_file_keys_are_errors() {
        assert!(serde_yaml::from_str::<FileConfig>("boardsize: 9\n").is_err());
    }

    #[test]
    fn no_viewer_disables_the_api() {
        let cli = Cli {
            no_viewer: true,
            ..Cli::default()
        };
        let config = ClientConfig::from_parts(cli, FileConfig::default()).unwrap();
        assert_eq!(config.viewer_addr, None);
        assert_eq!(config.paint_interval(), Duration::from_secs(1) / 60);
    }

    #[test]
    fn cli_parses_flags() {
        let cli = Cli::try_parse_from(["gobanview", "--board-size", "9", "--no-viewer"]).unwrap();
        assert_eq!(cli.board_size, Some(9));
        assert!(cli.no_viewer);
    }
}

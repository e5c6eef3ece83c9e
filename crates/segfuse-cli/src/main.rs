//! `segfuse` – point-cloud / instance-segmentation fusion node.
//!
//! ```text
//! segfuse [run]                              start the node
//! segfuse init                               (re)write ~/.segfuse/config.toml
//! segfuse replay <frame.json> <detection.json>
//! segfuse schema                             JSON Schema of the obstacle output
//! ```
//!
//! `run` checks for `~/.segfuse/config.toml` and runs the first-run wizard
//! when it is absent, probes the model server, then serves the rosbridge
//! endpoint and the fusion node until Ctrl-C.

mod config;
mod replay;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use segfuse_middleware::{BusAdapter, EventBus, Ros2Bridge};
use segfuse_runtime::{FusionNode, FusionPipeline, RemoteDetector};
use segfuse_types::ObstacleArray;
use tracing::{info, warn};

/// How long a single detector request may take.
const DETECTOR_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, PartialEq)]
enum Command {
    Run,
    Init,
    Replay { frame: PathBuf, detection: PathBuf },
    Schema,
    Help,
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Command, String> {
    let args: Vec<String> = args.into_iter().collect();
    match args.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
        [] | ["run"] => Ok(Command::Run),
        ["init"] => Ok(Command::Init),
        ["schema"] => Ok(Command::Schema),
        ["help"] | ["-h"] | ["--help"] => Ok(Command::Help),
        ["replay", frame, detection] => Ok(Command::Replay {
            frame: PathBuf::from(frame),
            detection: PathBuf::from(detection),
        }),
        ["replay", ..] => Err("usage: segfuse replay <frame.json> <detection.json>".to_string()),
        [other, ..] => Err(format!("unknown command `{other}` (try `segfuse help`)")),
    }
}

fn main() {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            std::process::exit(2);
        }
    };

    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"); SEGFUSE_LOG_FORMAT=json switches to
    // JSON.  OTEL_EXPORTER_OTLP_ENDPOINT enables span export.  Must run
    // before the Tokio runtime is built.
    let _telemetry = segfuse_runtime::init_tracing("segfuse");

    let result = match command {
        Command::Run => cmd_run(),
        Command::Init => {
            run_first_run_wizard();
            Ok(())
        }
        Command::Replay { frame, detection } => cmd_replay(&frame, &detection),
        Command::Schema => cmd_schema(),
        Command::Help => {
            print_help();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("{}: {}", "Error".red().bold(), e);
        std::process::exit(1);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_run() -> Result<(), String> {
    print_banner();

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            let mut cfg = run_first_run_wizard();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };
    let fusion = cfg.fusion_config()?;

    // ── Model server probe ────────────────────────────────────────────────
    // The blocking client is created here, outside the async runtime.
    let detector = RemoteDetector::new(&cfg.detector_url, DETECTOR_TIMEOUT).map_err(|e| e.to_string())?;
    print!("\n  Probing model server at {} … ", cfg.detector_url.dimmed());
    if detector.is_reachable() {
        println!("{}", "online".green());
    } else {
        println!("{}", "offline".yellow());
        println!(
            "  {}  Frames will be dropped until it answers on {}.",
            "No model server detected.".dimmed(),
            format!("{}/health", detector.base_url()).bold()
        );
    }

    let node = FusionNode::new(FusionPipeline::new(fusion, detector).map_err(|e| e.to_string())?);
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.bridge_port));

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – finishing the current frame …".yellow().bold());
        let _ = stop_tx.send(true);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("Failed to start async runtime: {e}"))?;

    runtime.block_on(async {
        let bus = Arc::new(EventBus::default());
        let bridge = Ros2Bridge::new(Arc::clone(&bus), cfg.pointcloud_topic.clone());
        let mut server = tokio::spawn(bridge.run_ws_server(addr));

        println!(
            "  rosbridge endpoint on {} · subscribing to {}\n",
            format!("ws://{addr}").bold(),
            cfg.pointcloud_topic.bold()
        );

        let adapter = Arc::new(BusAdapter::new(bus));
        let shutdown = async move {
            let _ = stop_rx.wait_for(|stop| *stop).await;
        };
        tokio::select! {
            () = node.run_until(adapter, shutdown) => {
                server.abort();
                Ok(())
            }
            res = &mut server => match res {
                Ok(Err(e)) => Err(e.to_string()),
                Ok(Ok(())) => Ok(()),
                Err(e) => Err(format!("rosbridge endpoint stopped: {e}")),
            },
        }
    })?;

    let stats = node.stats();
    info!(?stats, "node exited");
    println!(
        "{} {} frames processed, {} failed, {} dropped while busy.",
        "  ✓".green(),
        stats.processed,
        stats.failed,
        stats.dropped_busy
    );
    Ok(())
}

fn cmd_replay(frame: &std::path::Path, detection: &std::path::Path) -> Result<(), String> {
    let cfg = config::load_or_default()?;
    let obstacles = replay::replay(frame, detection, &cfg)?;
    let json = serde_json::to_string_pretty(&obstacles)
        .map_err(|e| format!("Failed to serialize obstacles: {e}"))?;
    println!("{json}");
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(ObstacleArray);
    let json = serde_json::to_string_pretty(&schema)
        .map_err(|e| format!("Failed to serialize schema: {e}"))?;
    println!("{json}");
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║      segfuse First-Run Wizard        ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  Press Enter to keep the value in brackets.\n");

    let mut cfg = config::load().ok().flatten().unwrap_or_default();

    cfg.detector_url = prompt_line(
        &format!("  Model server URL [{}]: ", cfg.detector_url),
        &cfg.detector_url,
    );
    cfg.pointcloud_topic = prompt_line(
        &format!("  PointCloud2 topic [{}]: ", cfg.pointcloud_topic),
        &cfg.pointcloud_topic,
    );

    let port_str = prompt_line(
        &format!("  rosbridge WebSocket port [{}]: ", cfg.bridge_port),
        &cfg.bridge_port.to_string(),
    );
    if let Ok(p) = port_str.trim().parse::<u16>() {
        cfg.bridge_port = p;
    }

    let k_str = prompt_line(
        &format!("  Down-sample factor [{}]: ", cfg.downsample_factor),
        &cfg.downsample_factor.to_string(),
    );
    match k_str.trim().parse::<usize>() {
        Ok(k) if k > 0 => cfg.downsample_factor = k,
        _ => println!("  {}", "Invalid factor; keeping the current value.".yellow()),
    }

    let current = join_categories(&cfg.categories);
    let cats = prompt_line(
        &format!("  Class ids to keep, comma separated, empty for all [{current}]: "),
        &current,
    );
    match parse_categories(&cats) {
        Ok(c) => cfg.categories = c,
        Err(e) => println!("  {}: {}", "Keeping the current classes".yellow(), e),
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

fn join_categories(categories: &[u32]) -> String {
    categories
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

fn parse_categories(raw: &str) -> Result<Vec<u32>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u32>().map_err(|_| format!("`{s}` is not a class id")))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner / help
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"                  ____         "#.bold().cyan());
    println!("{}", r#"  ___ ___ ___ _  / _/_ _____ ___ "#.bold().cyan());
    println!("{}", r#" (_-</ -_) _ `/ / _/ // (_-</ -_)"#.bold().cyan());
    println!("{}", r#"/___/\__/\_, / /_/ \_,_/___/\__/ "#.bold().cyan());
    println!("{}", r#"        /___/                    "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "segfuse".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Point-cloud obstacle detection from instance masks");
    println!();
}

fn print_help() {
    println!("{}", "segfuse – point-cloud / instance-segmentation fusion".bold());
    println!();
    println!("  {}                 start the node (default)", "run".cyan());
    println!("  {}                write ~/.segfuse/config.toml", "init".cyan());
    println!(
        "  {} <frame> <det>  process one recorded frame, print obstacles",
        "replay".cyan()
    );
    println!("  {}              print the obstacle JSON Schema", "schema".cyan());
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_arguments_means_run() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
        assert_eq!(parse_args(args(&["run"])).unwrap(), Command::Run);
    }

    #[test]
    fn replay_takes_two_paths() {
        assert_eq!(
            parse_args(args(&["replay", "f.json", "d.json"])).unwrap(),
            Command::Replay {
                frame: PathBuf::from("f.json"),
                detection: PathBuf::from("d.json"),
            }
        );
        assert!(parse_args(args(&["replay", "f.json"])).unwrap_err().contains("usage"));
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = parse_args(args(&["launch"])).unwrap_err();
        assert!(err.contains("launch"));
        assert_eq!(parse_args(args(&["--help"])).unwrap(), Command::Help);
    }

    #[test]
    fn categories_parse_and_join() {
        assert_eq!(parse_categories("0, 2,56").unwrap(), vec![0, 2, 56]);
        assert_eq!(parse_categories("").unwrap(), Vec::<u32>::new());
        assert!(parse_categories("0,car").is_err());
        assert_eq!(join_categories(&[0, 2]), "0,2");
    }

    #[test]
    fn schema_describes_obstacles() {
        let schema = serde_json::to_value(schemars::schema_for!(ObstacleArray)).unwrap();
        assert_eq!(schema["title"], "ObstacleArray");
        assert!(schema["properties"]["obstacles"].is_object());
        assert!(schema["definitions"]["Obstacle"].is_object());
    }
}

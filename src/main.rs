use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::time::interval;

use netbridle::backends::capture::{detect_capture_backends, select_capture_backend, StartError};
use netbridle::backends::ports::{detect_ports_backends, select_ports_backend};
use netbridle::engine::Engine;
use netbridle::rules::Rule;

/// netbridle - govern per-process network bandwidth
#[derive(Parser, Debug)]
#[command(name = "netbridle")]
#[command(version)]
#[command(about = "Per-process network bandwidth governor", long_about = None)]
struct Args {
    /// Global download cap in KB/s
    #[arg(long, value_name = "KBPS")]
    global_download: Option<u32>,

    /// Global upload cap in KB/s
    #[arg(long, value_name = "KBPS")]
    global_upload: Option<u32>,

    /// PID to govern
    #[arg(long, value_name = "PID")]
    pid: Option<u32>,

    /// Download limit for --pid in KB/s
    #[arg(long, value_name = "KBPS")]
    download: Option<u32>,

    /// Upload limit for --pid in KB/s
    #[arg(long, value_name = "KBPS")]
    upload: Option<u32>,

    /// Drop all traffic for --pid
    #[arg(long)]
    block: bool,

    /// Adaptively tune enforced rates toward the configured limits
    #[arg(long)]
    adaptive: bool,

    /// JSON file with per-PID rules applied at startup
    #[arg(long, value_name = "FILE")]
    rules: Option<PathBuf>,

    /// Capture backend to use
    #[arg(long, value_name = "BACKEND")]
    capture_backend: Option<String>,

    /// Port-table backend to use
    #[arg(long, value_name = "BACKEND")]
    ports_backend: Option<String>,

    /// List all available backends and exit
    #[arg(long)]
    list_backends: bool,

    /// List processes with network activity and exit
    #[arg(long)]
    list_processes: bool,

    /// Run for this many seconds, then stop (default: until Ctrl+C)
    #[arg(long, value_name = "SECONDS")]
    duration: Option<u64>,
}

/// One entry of the --rules file.
#[derive(Debug, serde::Deserialize)]
struct RuleEntry {
    pid: u32,
    #[serde(flatten)]
    rule: Rule,
}

fn print_available_backends() {
    println!("netbridle - Available Backends\n");

    println!("Capture Backends:");
    for backend in detect_capture_backends() {
        let status = if backend.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:12} [priority: {:?}] {}",
            backend.name, backend.priority, status
        );
    }

    println!("\nPort-Table Backends:");
    for backend in detect_ports_backends() {
        let status = if backend.available {
            "available"
        } else {
            "unavailable"
        };
        println!(
            "  {:12} [priority: {:?}] {}",
            backend.name, backend.priority, status
        );
    }
}

fn load_rules_file(path: &PathBuf) -> Result<Vec<RuleEntry>> {
    let contents =
        std::fs::read_to_string(path).context(format!("Failed to read rules file: {:?}", path))?;
    let entries: Vec<RuleEntry> =
        serde_json::from_str(&contents).context("Failed to parse rules file")?;
    Ok(entries)
}

/// Format a rate as a human-readable string (e.g. "1.5 MB/s", "500 KB/s")
fn human_rate(bytes_per_sec: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;

    if bytes_per_sec >= MB {
        format!("{:.1} MB/s", bytes_per_sec / MB)
    } else if bytes_per_sec >= KB {
        format!("{:.1} KB/s", bytes_per_sec / KB)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

/// Format bytes as a human-readable string (e.g. "1.5 MB", "500 KB")
fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn print_status(engine: &Engine) {
    let (dl, ul) = engine.global_rates();
    println!(
        "dl {:>12}  ul {:>12}  processed {}  dropped {}",
        human_rate(dl),
        human_rate(ul),
        engine.packets_processed(),
        engine.packets_dropped()
    );
}

async fn run() -> Result<()> {
    let args = Args::parse();

    if std::env::var("RUST_LOG").is_ok() {
        pretty_env_logger::formatted_builder()
            .parse_default_env()
            .init();
    }

    if args.list_backends {
        print_available_backends();
        return Ok(());
    }

    let ports = select_ports_backend(args.ports_backend.as_deref())?;

    if args.list_processes {
        let opener = select_capture_backend(Some("sim"))?;
        let engine = Engine::new(opener, ports);
        engine.refresh_port_maps()?;
        for (pid, name) in engine.list_network_processes() {
            println!("{:>8}  {}", pid, name);
        }
        return Ok(());
    }

    let opener = select_capture_backend(args.capture_backend.as_deref())?;
    if opener.name() == "sim" && args.capture_backend.is_none() {
        log::warn!("no kernel capture hook available on this host; using the simulated backend");
    }
    let engine = Engine::new(opener, ports);

    let mut global = Rule::default();
    if let Some(kbps) = args.global_download {
        global.limit_download = true;
        global.download_kbps = kbps;
    }
    if let Some(kbps) = args.global_upload {
        global.limit_upload = true;
        global.upload_kbps = kbps;
    }
    if global.has_any_rule() {
        global.adaptive = args.adaptive;
        engine.set_global_rule(global);
    }

    if let Some(pid) = args.pid {
        let mut rule = Rule {
            block_all: args.block,
            adaptive: args.adaptive,
            ..Rule::default()
        };
        if let Some(kbps) = args.download {
            rule.limit_download = true;
            rule.download_kbps = kbps;
        }
        if let Some(kbps) = args.upload {
            rule.limit_upload = true;
            rule.upload_kbps = kbps;
        }
        engine.set_rule(pid, rule);
    }

    if let Some(path) = &args.rules {
        for entry in load_rules_file(path)? {
            log::info!("applying rule for PID {} from {:?}", entry.pid, path);
            engine.set_rule(entry.pid, entry.rule);
        }
    }

    engine.start()?;
    println!("netbridle running - press Ctrl+C to stop");

    let status_loop = async {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.tick().await; // the first tick fires immediately
        loop {
            ticker.tick().await;
            print_status(&engine);
        }
    };

    if let Some(secs) = args.duration {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {
                println!("\nduration elapsed, stopping");
            }
            _ = signal::ctrl_c() => {
                println!("\nreceived Ctrl+C, stopping");
            }
            _ = status_loop => {}
        }
    } else {
        tokio::select! {
            _ = signal::ctrl_c() => {
                println!("\nreceived Ctrl+C, stopping");
            }
            _ = status_loop => {}
        }
    }

    let (dl, ul) = engine.global_totals();
    engine.stop();
    println!(
        "processed {} packets, dropped {}",
        engine.packets_processed(),
        engine.packets_dropped()
    );
    println!(
        "downloaded {}, uploaded {}",
        human_bytes(dl),
        human_bytes(ul)
    );

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if let Some(start) = err.downcast_ref::<StartError>() {
                eprintln!("error: {}", start);
                ExitCode::from(start.exit_code() as u8)
            } else {
                eprintln!("error: {:#}", err);
                ExitCode::FAILURE
            }
        }
    }
}

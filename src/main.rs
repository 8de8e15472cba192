use clap::{Parser, Subcommand};
use std::error::Error;
use std::fs;
use std::path::PathBuf;

use droid_pilot::agent::types::CancelToken;
use droid_pilot::config;
use droid_pilot::device::{AdbDevice, discovery};
use droid_pilot::llm::{ChatClient, LlmConfig, check_health};
use droid_pilot::orchestrator::{RunParts, run_fleet};
use droid_pilot::trace::RunSummary;
use droid_pilot::ui::{Viewport, render_elements, simplify};

/// droid-pilot - LLM-driven Android UI automation
#[derive(Parser, Debug)]
#[command(
    name = "droid-pilot",
    about = "Drive Android devices toward natural-language goals with an observe-think-act LLM loop",
    after_help = "ENVIRONMENT VARIABLES:\n\
        DROID_PILOT_LLM_ENDPOINT     Chat-completions endpoint URL\n\
        DROID_PILOT_LLM_MODEL        Model name\n\
        DROID_PILOT_ADB_PATH         Path to the adb executable\n\
        DROID_PILOT_MAX_STEPS        Maximum steps per run\n\
        DROID_PILOT_RETRY_ATTEMPTS   Per-step attempt budget\n\
        DROID_PILOT_RUNS_DIR         Base directory for run output"
)]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run tasks across connected devices
    Run {
        /// A task to queue (repeatable)
        #[arg(short, long)]
        task: Vec<String>,

        /// File with one task per line (lines starting with # are skipped)
        #[arg(long)]
        tasks_file: Option<PathBuf>,

        /// Device serial to use (repeatable; default: all discovered devices)
        #[arg(short, long)]
        device: Vec<String>,

        /// Remote endpoint to `adb connect` before discovery (host:port, repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Maximum steps per run
        #[arg(long, env = "DROID_PILOT_MAX_STEPS")]
        max_steps: Option<u32>,

        /// Per-step attempt budget
        #[arg(long, env = "DROID_PILOT_RETRY_ATTEMPTS")]
        attempts: Option<u32>,

        /// Fail a step on the first bad response instead of retrying
        #[arg(long)]
        no_retry: bool,

        /// Text-only prompts (no screenshots attached)
        #[arg(long)]
        no_vision: bool,

        /// Base directory for run output
        #[arg(short, long, env = "DROID_PILOT_RUNS_DIR")]
        output: Option<PathBuf>,

        /// Output run summaries as JSON
        #[arg(long)]
        json: bool,
    },

    /// List devices reachable over adb
    Devices {
        /// Remote endpoint to `adb connect` before discovery (host:port, repeatable)
        #[arg(long)]
        connect: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Simplify a saved uiautomator dump and print the element listing
    Simplify {
        /// Path to a layout XML file
        #[arg(short, long)]
        input: PathBuf,

        /// Screen size the dump was taken at, as WxH
        #[arg(long, short = 's', default_value = "1080x1920")]
        size: String,

        /// Output elements as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Some(Commands::Run {
            task,
            tasks_file,
            device,
            connect,
            max_steps,
            attempts,
            no_retry,
            no_vision,
            output,
            json,
        }) => {
            let mut tasks = task;
            if let Some(path) = tasks_file {
                let text = fs::read_to_string(&path)?;
                tasks.extend(
                    text.lines()
                        .map(str::trim)
                        .filter(|l| !l.is_empty() && !l.starts_with('#'))
                        .map(String::from),
                );
            }
            if tasks.is_empty() {
                return Err("no tasks given; use --task or --tasks-file".into());
            }

            let devices = if device.is_empty() {
                discovery::discover(&connect)?
            } else {
                for host in &connect {
                    let _ = discovery::connect(host);
                }
                device
            };
            if devices.is_empty() {
                return Err("no devices available; is adb running?".into());
            }

            let cfg = config::get();
            if !check_health(&cfg.llm.endpoint, cfg.llm.connect_timeout).unwrap_or(false) {
                eprintln!(
                    "warning: provider endpoint {} is not answering; runs may fail",
                    cfg.llm.endpoint
                );
            }

            let mut settings = cfg.agent.clone();
            if let Some(n) = max_steps {
                settings.max_steps = n;
            }
            if let Some(n) = attempts {
                settings.retry_attempts = n;
            }
            if no_retry {
                settings.retry_enabled = false;
            }
            if no_vision {
                settings.vision_enabled = false;
            }

            let runs_dir = output.unwrap_or_else(|| PathBuf::from(&cfg.runs.base_dir));
            let cancel = CancelToken::new();

            let factory = |serial: &str| -> RunParts {
                (
                    Box::new(AdbDevice::new(serial)) as _,
                    Box::new(ChatClient::new(LlmConfig::default())) as _,
                )
            };
            let summaries = run_fleet(&devices, tasks, &settings, &runs_dir, &cancel, factory);

            if json {
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else {
                print_summaries(&summaries);
            }
            Ok(())
        }

        Some(Commands::Devices { connect, json }) => {
            let devices = discovery::discover(&connect)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&devices)?);
            } else if devices.is_empty() {
                println!("No devices found.");
            } else {
                for serial in devices {
                    println!("{}", serial);
                }
            }
            Ok(())
        }

        Some(Commands::Simplify { input, size, json }) => {
            let viewport = parse_size(&size)
                .ok_or_else(|| format!("Invalid size '{}'. Use WxH, e.g. 1080x1920", size))?;
            let xml = fs::read_to_string(&input)?;
            let elements = simplify(&xml, viewport)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&elements)?);
            } else {
                print!("{}", render_elements(&elements));
            }
            Ok(())
        }

        None => {
            eprintln!("No command specified. Use --help for usage information.");
            std::process::exit(1);
        }
    }
}

fn print_summaries(summaries: &[RunSummary]) {
    for s in summaries {
        println!(
            "[{}] {} -> {} ({} steps, {} tokens, {:.1}s)",
            s.device_id,
            s.task,
            s.final_status,
            s.total_steps,
            s.token_usage.total_tokens,
            s.duration_seconds
        );
        if !s.summary_text.is_empty() {
            println!("    {}", s.summary_text);
        }
    }
}

/// Parse a `WxH` screen size string
fn parse_size(size: &str) -> Option<Viewport> {
    let (w, h) = size.split_once('x')?;
    Some(Viewport {
        width: w.trim().parse().ok()?,
        height: h.trim().parse().ok()?,
    })
}

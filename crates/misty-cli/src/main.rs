//! `misty-cli` – runs one robot skill from the terminal.
//!
//! ```text
//! misty face              greet known faces, train unknown ones
//! misty qa                answer spoken questions
//! misty battery [SECS]    print battery updates for SECS seconds (default 10)
//! misty hey               light up whenever the robot hears "Hey, Misty"
//! misty init              write ~/.misty/config.toml
//! ```
//!
//! Append `--json` to print the final skill report as JSON.  Console lines
//! are forwarded to the running skill; Ctrl-C sends it a `stop` line.

mod config;
mod console;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use misty_middleware::{ActionApi, RestActionApi, pubsub_url};
use misty_runtime::skills::battery_printer::{BatteryPrinterConfig, battery_printer};
use misty_runtime::skills::face_recognition::{FaceRecognition, FaceRecognitionConfig};
use misty_runtime::skills::hey_misty::{HeyMisty, HeyMistyConfig};
use misty_runtime::skills::question_answering::{QuestionAnswering, QuestionAnsweringConfig};
use misty_runtime::{SkillInput, SkillInputs, SkillReport, WitTranscriber};
use tokio::sync::mpsc::UnboundedSender;
use tracing::warn;

const DEFAULT_BATTERY_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SkillChoice {
    Face,
    QuestionAnswering,
    Battery(Duration),
    HeyMisty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run { skill: SkillChoice, json: bool },
    Init,
    Help,
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let json = args.iter().any(|a| a == "--json");
    let mut positional = args.iter().map(String::as_str).filter(|a| *a != "--json");

    let skill = match positional.next() {
        None | Some("help" | "-h" | "--help") => return Ok(Command::Help),
        Some("init") => return Ok(Command::Init),
        Some("face") => SkillChoice::Face,
        Some("qa") => SkillChoice::QuestionAnswering,
        Some("hey") => SkillChoice::HeyMisty,
        Some("battery") => {
            let secs = match positional.next() {
                Some(s) => s.parse::<u64>().map_err(|_| format!("invalid duration `{s}`"))?,
                None => DEFAULT_BATTERY_SECS,
            };
            SkillChoice::Battery(Duration::from_secs(secs))
        }
        Some(other) => return Err(format!("unknown command `{other}`")),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("unexpected argument `{extra}`"));
    }
    Ok(Command::Run { skill, json })
}

fn main() -> ExitCode {
    // Held until exit so pending spans are flushed.
    let _telemetry = misty_runtime::init_tracing("misty");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{}: {}", "Error".red(), e);
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    let (skill, json) = match command {
        Command::Help => {
            print_usage();
            return ExitCode::SUCCESS;
        }
        Command::Init => return run_init_wizard(),
        Command::Run { skill, json } => (skill, json),
    };

    let cfg = load_config();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };
    let report = runtime.block_on(run_skill(skill, &cfg));

    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("{}: {}", "Failed to serialize report".red(), e),
        }
    } else {
        print_report(&report);
    }

    if report.overall_success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Skill launch
// ─────────────────────────────────────────────────────────────────────────────

async fn run_skill(skill: SkillChoice, cfg: &config::Config) -> SkillReport {
    let url = pubsub_url(&cfg.robot_ip);
    let api: Arc<dyn ActionApi> = Arc::new(RestActionApi::new(&cfg.robot_ip));
    println!("  Robot at {}", cfg.robot_ip.bold());

    match skill {
        SkillChoice::Battery(duration) => {
            let mut skill_cfg = BatteryPrinterConfig::new(url, duration);
            skill_cfg.debounce_ms = cfg.debounce_ms;
            skill_cfg.max_entries = cfg.history_len;
            battery_printer(skill_cfg).await
        }
        SkillChoice::Face => {
            let inputs = attach_console();
            let mut skill_cfg = FaceRecognitionConfig::new(url);
            skill_cfg.debounce_ms = cfg.debounce_ms;
            skill_cfg.max_entries = cfg.history_len;
            FaceRecognition::new(api, skill_cfg).run(inputs).await
        }
        SkillChoice::HeyMisty => {
            let inputs = attach_console();
            let mut skill_cfg = HeyMistyConfig::new(url);
            skill_cfg.debounce_ms = cfg.debounce_ms;
            skill_cfg.max_entries = cfg.history_len;
            HeyMisty::new(api, skill_cfg).run(inputs).await
        }
        SkillChoice::QuestionAnswering => {
            if cfg.wit_ai_key.is_empty() {
                println!(
                    "  {} set {} or run `{}`; transcription will fail.",
                    "No wit.ai key:".yellow(),
                    "MISTY_WIT_AI_KEY".bold(),
                    "misty init".bold()
                );
            }
            let inputs = attach_console();
            let transcriber = Arc::new(WitTranscriber::new(cfg.wit_ai_key.clone()));
            let mut skill_cfg = QuestionAnsweringConfig::new(url, cfg.recordings_dir.clone());
            skill_cfg.debounce_ms = cfg.debounce_ms;
            skill_cfg.max_entries = cfg.history_len;
            QuestionAnswering::new(api, transcriber, skill_cfg).run(inputs).await
        }
    }
}

/// Input queue fed by stdin and by Ctrl-C.
fn attach_console() -> SkillInputs {
    let inputs = SkillInputs::new();
    console::forward_stdin(inputs.sender());
    install_ctrlc(inputs.sender());
    inputs
}

fn install_ctrlc(sender: UnboundedSender<SkillInput>) {
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – asking the skill to stop …".yellow().bold());
        let _ = sender.send(SkillInput::UserLine("stop".to_string()));
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; type `stop` to end the skill");
    }
}

fn load_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => {
            println!(
                "  No config at {}; using defaults. Run `{}` to create one.",
                config::config_path().display().to_string().dimmed(),
                "misty init".bold()
            );
            let mut cfg = config::Config::default();
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
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Output
// ─────────────────────────────────────────────────────────────────────────────

fn print_report(report: &SkillReport) {
    println!();
    let verdict = if report.overall_success {
        "SUCCESS".green().bold()
    } else {
        "FAILED".red().bold()
    };
    println!("  Skill finished: {verdict}");
    for entry in &report.actions {
        let mark = if entry.result.success { "✓".green() } else { "✗".red() };
        match &entry.result.message {
            Some(message) => println!("    {mark} {} ({})", entry.name, message.dimmed()),
            None => println!("    {mark} {}", entry.name),
        }
    }
    if let Some(data) = &report.data {
        println!("  Data: {data}");
    }
}

fn print_usage() {
    println!();
    println!("  {} {}", "misty".bold(), format!("v{}", env!("CARGO_PKG_VERSION")).dimmed());
    println!();
    println!("  {}", "Usage:".bold());
    println!("    misty face              greet known faces, train unknown ones");
    println!("    misty qa                answer spoken questions");
    println!("    misty battery [SECS]    print battery updates (default {DEFAULT_BATTERY_SECS} s)");
    println!("    misty hey               react to \"Hey, Misty\" until Enter is pressed");
    println!("    misty init              write {}", config::config_path().display());
    println!();
    println!("  Add {} to print the skill report as JSON.", "--json".bold());
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Init wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_init_wizard() -> ExitCode {
    println!();
    println!("{}", "  Misty configuration".bold().cyan());
    println!();

    let mut cfg = wizard_defaults(&config::config_path());
    cfg.robot_ip = prompt_line(&format!("  Robot IP address [{}]: ", cfg.robot_ip), &cfg.robot_ip);
    let key_hint = if cfg.wit_ai_key.is_empty() { "not set" } else { "keep current" };
    cfg.wit_ai_key = prompt_line(&format!("  wit.ai server token [{key_hint}]: "), &cfg.wit_ai_key);
    let dir = cfg.recordings_dir.display().to_string();
    cfg.recordings_dir = prompt_line(&format!("  Recordings directory [{dir}]: "), &dir).into();

    match config::save(&cfg) {
        Ok(()) => {
            println!(
                "\n  {} Config saved to {}\n",
                "✓".green().bold(),
                config::config_path().display().to_string().bold()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            println!("{}: {}", "Error saving config".red(), e);
            ExitCode::FAILURE
        }
    }
}

/// Values the wizard offers as defaults: the saved file only, so keys that
/// merely live in the shell environment are never written to disk.
fn wizard_defaults(path: &std::path::Path) -> config::Config {
    config::load_from(path).ok().flatten().unwrap_or_default()
}

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

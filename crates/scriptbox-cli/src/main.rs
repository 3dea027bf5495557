//! Scriptbox - sandboxed script runner CLI
//!
//! The `scriptbox` command submits Lua script text to the engine and streams
//! its output to the console.
//!
//! ## Commands
//!
//! - `run`: Execute a script file (or stdin with `-`)
//! - `eval`: Execute inline script text
//! - `capabilities`: Print the capability manifest

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn, Level};

use scriptbox_core::{
    CapabilityRegistry, EngineConfig, ExecutionResult, ScriptSubmission, SessionManager,
    SessionState, StreamKind,
};

#[derive(Parser)]
#[command(name = "scriptbox")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandboxed Lua script runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (JSON)
    #[arg(long, global = true, env = "SCRIPTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Wall-clock budget per script, in milliseconds
    #[arg(long, global = true, env = "SCRIPTBOX_TIMEOUT_MS")]
    timeout_ms: Option<u64>,

    /// Cumulative output allowed per script, in bytes
    #[arg(long, global = true)]
    max_output_bytes: Option<u64>,

    /// Interpreter heap limit, in bytes
    #[arg(long, global = true)]
    memory_limit_bytes: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script file
    Run {
        /// Script path, or `-` to read from stdin
        path: PathBuf,

        /// Execution context the script is submitted on
        #[arg(short, long, default_value = "console")]
        context: String,

        /// Print the execution result as JSON on stdout when done
        #[arg(long)]
        result_json: bool,
    },

    /// Run inline script text
    Eval {
        /// Script source
        code: String,

        /// Execution context the script is submitted on
        #[arg(short, long, default_value = "console")]
        context: String,

        /// Print the execution result as JSON on stdout when done
        #[arg(long)]
        result_json: bool,
    },

    /// Show which names scripts may use
    Capabilities {
        /// Print the manifest as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    scriptbox_core::init_tracing(cli.json, level);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            path,
            context,
            result_json,
        } => {
            let source = read_source(&path)?;
            let result = cmd_run(config, &context, source, result_json).await?;
            Ok(ExitCode::from(exit_code(result.state)))
        }
        Commands::Eval {
            code,
            context,
            result_json,
        } => {
            let result = cmd_run(config, &context, code, result_json).await?;
            Ok(ExitCode::from(exit_code(result.state)))
        }
        Commands::Capabilities { json } => {
            cmd_capabilities(json)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Config file (if any) with command-line overrides layered on top.
fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(ms) = cli.timeout_ms {
        config.default_timeout_ms = Some(ms);
    }
    if let Some(bytes) = cli.max_output_bytes {
        config.max_output_bytes = Some(bytes);
    }
    if let Some(bytes) = cli.memory_limit_bytes {
        config.memory_limit_bytes = Some(bytes);
    }
    config.validate().context("Invalid engine configuration")?;
    Ok(config)
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read script from stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script {}", path.display()))
    }
}

async fn cmd_run(
    config: EngineConfig,
    context: &str,
    source: String,
    result_json: bool,
) -> Result<ExecutionResult> {
    let mgr = SessionManager::new(config).context("Failed to start engine")?;
    let handle = mgr
        .submit(ScriptSubmission::new(context, source))
        .await
        .context("Script was not accepted")?;
    info!(session_id = %handle.id, context_id = %handle.context_id, "Script submitted");

    let mut stream = mgr
        .subscribe(handle.id)
        .context("Failed to subscribe to script output")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    loop {
        tokio::select! {
            chunk = stream.next_chunk() => {
                let Some(chunk) = chunk else { break };
                match chunk.stream {
                    StreamKind::Stdout => {
                        let mut out = std::io::stdout().lock();
                        out.write_all(chunk.text.as_bytes())?;
                        out.flush()?;
                    }
                    StreamKind::Stderr => {
                        let mut err = std::io::stderr().lock();
                        err.write_all(chunk.text.as_bytes())?;
                        err.flush()?;
                    }
                }
            }
            signal = &mut ctrl_c, if !interrupted => {
                interrupted = true;
                signal.context("Failed to listen for Ctrl-C")?;
                if let Err(e) = mgr.cancel(handle.id) {
                    warn!(session_id = %handle.id, error = %e, "Cancel had no effect");
                }
            }
        }
    }

    let result = mgr
        .await_result(handle.id)
        .await
        .context("Failed to obtain execution result")?;

    eprint!("{}", render_summary(&result));
    if result_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }
    Ok(result)
}

fn cmd_capabilities(json: bool) -> Result<()> {
    let manifest = CapabilityRegistry::standard().manifest();
    if json {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    println!("Symbols:");
    for symbol in &manifest.symbols {
        println!("  {symbol}");
    }
    println!("\nModules:");
    for (name, members) in &manifest.modules {
        println!("  {name}: {}", members.join(", "));
    }
    println!("\nDenied:");
    for (name, reason) in &manifest.denied {
        println!("  {name}: {reason}");
    }
    Ok(())
}

fn exit_code(state: SessionState) -> u8 {
    match state {
        SessionState::Succeeded => 0,
        SessionState::TimedOut => 124,
        SessionState::Cancelled => 130,
        _ => 1,
    }
}

fn render_summary(result: &ExecutionResult) -> String {
    let mut out = format!(
        "[{}] {} in {}\n",
        result.state,
        result.session_id,
        format_duration(Duration::from_millis(result.duration_ms))
    );
    if let Some(fault) = &result.fault {
        out.push_str(&format!("{}: {}\n", fault.kind, fault.message));
        if !fault.trace.is_empty() {
            out.push_str("trace (innermost last):\n");
            for frame in &fault.trace {
                out.push_str(&format!("  {frame}\n"));
            }
        }
    }
    out
}

fn format_duration(d: Duration) -> String {
    if d.as_secs() > 0 {
        format!("{:.2}s", d.as_secs_f64())
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptbox_core::{ContextId, Fault, FaultKind, SessionId, TraceFrame};
    use std::io::Write as _;

    fn result(state: SessionState, fault: Option<Fault>) -> ExecutionResult {
        ExecutionResult {
            session_id: SessionId::new(),
            context_id: ContextId::new("console"),
            state,
            duration_ms: 42,
            fault,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(SessionState::Succeeded), 0);
        assert_eq!(exit_code(SessionState::Failed), 1);
        assert_eq!(exit_code(SessionState::TimedOut), 124);
        assert_eq!(exit_code(SessionState::Cancelled), 130);
    }

    #[test]
    fn test_parse_run_with_overrides() {
        let cli = Cli::try_parse_from([
            "scriptbox",
            "--timeout-ms",
            "250",
            "run",
            "script.lua",
            "--context",
            "notebook",
        ])
        .unwrap();
        assert_eq!(cli.timeout_ms, Some(250));
        match cli.command {
            Commands::Run {
                path,
                context,
                result_json,
            } => {
                assert_eq!(path, PathBuf::from("script.lua"));
                assert_eq!(context, "notebook");
                assert!(!result_json);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_eval_defaults_to_console_context() {
        let cli = Cli::try_parse_from(["scriptbox", "eval", "print(1)"]).unwrap();
        match cli.command {
            Commands::Eval { code, context, .. } => {
                assert_eq!(code, "print(1)");
                assert_eq!(context, "console");
            }
            _ => panic!("expected eval"),
        }
    }

    #[test]
    fn test_flags_override_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_output_bytes": 10, "chunk_name": "cell"}}"#).unwrap();
        let path = file.path().to_str().unwrap().to_string();

        let cli = Cli::try_parse_from([
            "scriptbox",
            "--config",
            &path,
            "--max-output-bytes",
            "2048",
            "eval",
            "print(1)",
        ])
        .unwrap();
        let config = load_config(&cli).unwrap();
        assert_eq!(config.max_output_bytes, Some(2048));
        assert_eq!(config.chunk_name, "cell");
    }

    #[test]
    fn test_zero_timeout_is_rejected() {
        let cli =
            Cli::try_parse_from(["scriptbox", "--timeout-ms", "0", "eval", "print(1)"]).unwrap();
        assert!(load_config(&cli).is_err());
    }

    #[test]
    fn test_summary_lists_trace() {
        let fault = Fault::new(FaultKind::RuntimeFault, "script:3: kaboom").with_trace(vec![
            TraceFrame {
                symbol: "main chunk".to_string(),
                source: Some("script".to_string()),
                line: Some(5),
            },
            TraceFrame {
                symbol: "explode".to_string(),
                source: Some("script".to_string()),
                line: Some(3),
            },
        ]);
        let summary = render_summary(&result(SessionState::Failed, Some(fault)));
        assert!(summary.starts_with("[failed]"));
        assert!(summary.contains("runtime_fault: script:3: kaboom"));
        assert!(summary.contains("trace (innermost last):"));
        let explode = summary.find("explode").unwrap();
        let main = summary.find("main chunk").unwrap();
        assert!(main < explode);
    }

    #[test]
    fn test_summary_without_fault() {
        let summary = render_summary(&result(SessionState::Succeeded, None));
        assert!(summary.starts_with("[succeeded]"));
        assert!(summary.ends_with("42ms\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_cmd_run_reports_failure() {
        let result = cmd_run(
            EngineConfig::default(),
            "console",
            "error('boom')".to_string(),
            false,
        )
        .await
        .unwrap();
        assert_eq!(result.state, SessionState::Failed);
        assert_eq!(exit_code(result.state), 1);
    }
}

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tillerman_backend::{ChartDir, HelmCli};
use tillerman_core::{RawInput, ReconcileOutcome};
use tillerman_kubehub::provisioner_for;
use tillerman_manifest::StderrDiffer;
use tillerman_reconcile::{ReconcileError, Reconciler};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "tillerman", version, about = "Reconcile one Helm release toward present, absent or purged")]
struct Cli {
    /// JSON file holding the module arguments
    args_file: PathBuf,

    /// helm binary to run (default: $TILLERMAN_HELM_BIN, then `helm` from PATH)
    #[arg(long = "helm-bin")]
    helm_bin: Option<PathBuf>,
}

/// The result document printed to stdout.
#[derive(Debug, Serialize)]
struct ModuleOutput {
    #[serde(skip_serializing_if = "String::is_empty")]
    msg: String,
    changed: bool,
    failed: bool,
    invocation: Invocation,
}

#[derive(Debug, Serialize)]
struct Invocation {
    module_args: RawInput,
}

impl ModuleOutput {
    fn succeed(args: RawInput, outcome: ReconcileOutcome) -> Self {
        Self { msg: outcome.message, changed: outcome.changed, failed: false, invocation: Invocation { module_args: args } }
    }

    fn fail(args: RawInput, msg: String) -> Self {
        Self { msg, changed: false, failed: true, invocation: Invocation { module_args: args } }
    }
}

fn init_tracing() {
    let env = std::env::var("TILLERMAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // stdout carries the result document
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn load_input(path: &Path) -> Result<RawInput, String> {
    let text = std::fs::read_to_string(path).map_err(|e| format!("error reading input: {}", e))?;
    let raw: RawInput = serde_json::from_str(&text).map_err(|e| format!("unable to parse input: {}", e))?;
    Ok(raw.normalize())
}

fn failure_message(err: ReconcileError) -> String {
    match err {
        ReconcileError::Connectivity(e) => format!("unable to forward tiller port: {}", e),
        other => other.to_string(),
    }
}

async fn execute(cli: &Cli, input: &RawInput) -> Result<ReconcileOutcome, String> {
    let (spec, settings) = input.clone().into_parts();
    let helm = cli.helm_bin.clone().map(HelmCli::new).unwrap_or_else(HelmCli::from_env);
    let differ = StderrDiffer;
    let provisioner = provisioner_for(&settings);
    info!(release = %spec.release, state = %spec.state, namespace = %spec.namespace, "reconcile invoked");
    Reconciler::new(&helm, &ChartDir, &differ)
        .run(provisioner.as_ref(), &settings, &spec)
        .await
        .map_err(failure_message)
}

fn render(out: &ModuleOutput) -> String {
    serde_json::to_string(out)
        .unwrap_or_else(|e| serde_json::json!({ "msg": format!("unexpected output: {}", e), "changed": false, "failed": true }).to_string())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();

    let output = match load_input(&cli.args_file) {
        Err(msg) => ModuleOutput::fail(RawInput::default(), msg),
        Ok(input) => match execute(&cli, &input).await {
            Ok(outcome) => {
                info!(action = outcome.action.as_str(), changed = outcome.changed, "reconcile finished");
                ModuleOutput::succeed(input, outcome)
            }
            Err(msg) => ModuleOutput::fail(input, msg),
        },
    };
    if output.failed {
        error!(msg = %output.msg, "reconcile failed");
    }

    use std::io::Write;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", render(&output)).context("writing result")?;
    stdout.flush().context("flushing result")?;
    Ok(if output.failed { ExitCode::FAILURE } else { ExitCode::SUCCESS })
}

//! Binary entry point for the machinist CLI.

use std::io::{self, Write};
use std::process;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use machinist::ssh::SshError;
use machinist::{
    Cleanup, CleanupError, Exec, ExecError, HcloudClient, NamingError, Prepare, PrepareError,
    PrepareOptions, ProviderError, ResourceNamer, StateError, StateStore, VmParams,
};

#[derive(Debug, Parser)]
#[command(
    name = "machinist",
    about = "Provision, use, and tear down ephemeral CI build machines",
    arg_required_else_help = true
)]
struct Cli {
    /// Prefix every derived resource name starts with.
    #[arg(
        long,
        global = true,
        env = "CUSTOM_ENV_MACHINIST_RESOURCE_NAME_PREFIX",
        default_value = "machinist-job-"
    )]
    resource_name_prefix: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the machine for a job and wait until it accepts SSH sessions.
    Prepare(PrepareArgs),
    /// Run one job-stage script on the prepared machine.
    Exec(ExecArgs),
    /// Delete the job's machine and the local state file.
    Cleanup(CleanupArgs),
    /// Print the executor driver handshake on stdout.
    Configure,
}

#[derive(Args, Debug)]
struct PrepareArgs {
    #[command(flatten)]
    auth: AuthArgs,

    /// Deadline for the machine to become reachable.
    #[arg(
        long,
        env = "CUSTOM_ENV_MACHINIST_SERVER_WAIT_DEADLINE_SECS",
        default_value_t = 300
    )]
    wait_deadline_secs: u64,

    /// Extra public keys (newline-delimited) added to the machine.
    #[arg(
        long,
        env = "CUSTOM_ENV_MACHINIST_ADDITIONAL_AUTHORIZED_KEYS",
        default_value = ""
    )]
    additional_authorized_keys: String,

    /// Image selector: exact name, `<prefix>:latest`, or `label#<expr>`.
    #[arg(long, env = "CUSTOM_ENV_CI_JOB_IMAGE", default_value = "ubuntu-22.04")]
    vm_image: String,

    /// Server-type name, or `auto` to pick one from the location's catalog.
    #[arg(long, env = "CUSTOM_ENV_MACHINIST_SERVER_TYPE", default_value = "cx22")]
    vm_type: String,

    /// Location the machine is created in.
    #[arg(
        long,
        env = "CUSTOM_ENV_MACHINIST_SERVER_LOCATION",
        default_value = "fsn1"
    )]
    vm_location: String,

    /// Architecture tag (`amd64` or `arm64`) for automatic selection.
    #[arg(
        long,
        env = "CUSTOM_ENV_MACHINIST_ARCHITECTURE",
        default_value = "amd64"
    )]
    vm_architecture: String,
}

#[derive(Args, Debug)]
struct ExecArgs {
    /// Path to the script the orchestrator wants executed.
    script: Utf8PathBuf,

    /// Stage name, used for progress output only.
    stage: String,
}

#[derive(Args, Debug)]
struct CleanupArgs {
    #[command(flatten)]
    auth: AuthArgs,
}

#[derive(Args, Debug)]
struct AuthArgs {
    /// Hetzner Cloud API token.
    #[arg(long, env = "HCLOUD_TOKEN", hide_env_values = true)]
    hcloud_token: String,

    /// Job identifier the resource name derives from.
    #[arg(long, env = "CUSTOM_ENV_CI_JOB_ID")]
    job_id: String,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("invalid resource name prefix: {0}")]
    Naming(#[from] NamingError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error(transparent)]
    Exec(#[from] ExecError),
    #[error(transparent)]
    Cleanup(#[from] CleanupError),
    #[error("working directory is not usable: {0}")]
    WorkingDir(String),
    #[error("failed to write driver info: {0}")]
    DriverInfo(String),
}

#[derive(Serialize)]
struct DriverInfo {
    driver: DriverIdentity,
    hostname: String,
}

#[derive(Serialize)]
struct DriverIdentity {
    name: &'static str,
    version: &'static str,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("machinist=info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            exit_code_for(&err)
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let namer = ResourceNamer::new(cli.resource_name_prefix)?;

    match cli.command {
        Command::Prepare(args) => prepare(&namer, args).await,
        Command::Exec(args) => exec(args).await,
        Command::Cleanup(args) => cleanup(&namer, args).await,
        Command::Configure => configure(),
    }
}

async fn prepare(namer: &ResourceNamer, args: PrepareArgs) -> Result<(), CliError> {
    let provider = HcloudClient::new(args.auth.hcloud_token)?;
    let store = open_store()?;

    let options = PrepareOptions {
        job_id: args.auth.job_id,
        wait_deadline: Duration::from_secs(args.wait_deadline_secs),
        additional_authorized_keys: args.additional_authorized_keys,
    };
    let params = VmParams {
        image: args.vm_image,
        server_type: args.vm_type,
        location: args.vm_location,
        architecture: args.vm_architecture,
    };

    Prepare::new(&provider, namer, &store)
        .run(&options, &params)
        .await?;
    Ok(())
}

async fn exec(args: ExecArgs) -> Result<(), CliError> {
    let ExecArgs { script, stage } = args;
    let store = open_store()?;
    Exec::new(&store).run(&script, &stage).await?;
    Ok(())
}

async fn cleanup(namer: &ResourceNamer, args: CleanupArgs) -> Result<(), CliError> {
    let provider = HcloudClient::new(args.auth.hcloud_token)?;
    let store = open_store()?;
    Cleanup::new(&provider, namer, &store)
        .run(&args.auth.job_id)
        .await?;
    Ok(())
}

fn configure() -> Result<(), CliError> {
    let info = DriverInfo {
        driver: DriverIdentity {
            name: "machinist",
            version: env!("CARGO_PKG_VERSION"),
        },
        hostname: hostname(),
    };
    let payload =
        serde_json::to_string(&info).map_err(|err| CliError::DriverInfo(err.to_string()))?;
    writeln!(io::stdout(), "{payload}").map_err(|err| CliError::DriverInfo(err.to_string()))
}

/// CI containers set `HOSTNAME`; fall back to the system file outside them.
fn hostname() -> String {
    resolve_hostname(std::env::var("HOSTNAME").ok().as_deref()).unwrap_or_else(file_hostname)
}

fn resolve_hostname(env_value: Option<&str>) -> Option<String> {
    env_value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
}

fn file_hostname() -> String {
    std::fs::read_to_string("/etc/hostname")
        .map(|raw| raw.trim().to_owned())
        .unwrap_or_default()
}

fn open_store() -> Result<StateStore, CliError> {
    let cwd = std::env::current_dir().map_err(|err| CliError::WorkingDir(err.to_string()))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd)
        .map_err(|path| CliError::WorkingDir(path.display().to_string()))?;
    Ok(StateStore::open(&cwd)?)
}

/// The remote command's exit status passes through; everything else is 1.
fn exit_code_for(err: &CliError) -> i32 {
    match err {
        CliError::Exec(ExecError::Ssh(SshError::CommandFailed(code))) => *code,
        _ => 1,
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "machinist: {err}").ok();
}

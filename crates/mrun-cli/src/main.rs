use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mrun_runner::{
    Backend, BackendConfig, ConfigFile, DeployError, ImageBuilder, PrebuiltImage, RunReceipt,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "mrun",
    version = "0.3.0",
    about = "Ship experiments to a batch scheduler or a container cluster"
)]
struct Cli {
    /// Config file with named contexts.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Context to use instead of `current_context`.
    #[arg(long, global = true)]
    context: Option<String>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        spec: PathBuf,
        /// Prebuilt image for container-orchestration contexts.
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        json: bool,
        #[arg(last = true)]
        params: Vec<String>,
    },
    #[command(subcommand)]
    Context(ContextCommands),
}

#[derive(Subcommand)]
enum ContextCommands {
    List {
        #[arg(long)]
        json: bool,
    },
    Show {
        name: Option<String>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(&cli);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing(debug: bool) {
    let default_level = if debug {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run_command(cli: &Cli) -> Result<Option<Value>> {
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    match &cli.command {
        Commands::Run {
            spec,
            image,
            json,
            params,
        } => {
            let config = ConfigFile::load(&config_path)
                .with_context(|| format!("loading {}", config_path.display()))?;
            let (context_name, backend_config) = config.select(cli.context.as_deref())?;
            let specs = mrun_runner::load_experiment_specs(spec)?;
            let working_dir = mrun_runner::spec_working_directory(spec);
            let experiments = mrun_runner::resolve_experiments(specs, params, &working_dir)?;
            info!(
                context = context_name,
                backend = backend_config.kind().as_str(),
                experiments = experiments.len(),
                "starting runs"
            );

            let images = image
                .clone()
                .map(|reference| Box::new(PrebuiltImage(reference)) as Box<dyn ImageBuilder>);
            let mut backend = mrun_runner::open_backend(backend_config, images)?;
            let mut receipts = Vec::new();
            for experiment in &experiments {
                let receipt = backend
                    .run(experiment)
                    .with_context(|| format!("running experiment {}", experiment.name()))?;
                if !json {
                    print_receipt(&receipt);
                }
                receipts.push(receipt);
            }
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "context": context_name,
                    "runs": receipts,
                })));
            }
        }
        Commands::Context(ContextCommands::List { json }) => {
            let config = ConfigFile::load(&config_path)?;
            let current = config.current_context.as_deref();
            if *json {
                let contexts: Vec<Value> = config
                    .contexts
                    .iter()
                    .map(|(name, ctx)| context_to_json(name, ctx, current == Some(name.as_str())))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "context-list",
                    "contexts": contexts,
                })));
            }
            if config.contexts.is_empty() {
                println!("no contexts in {}", config_path.display());
            }
            for (name, ctx) in &config.contexts {
                let marker = if current == Some(name.as_str()) { "*" } else { " " };
                println!("{} {} ({})", marker, name, ctx.kind().as_str());
            }
        }
        Commands::Context(ContextCommands::Show { name, json }) => {
            let config = ConfigFile::load(&config_path)?;
            let (name, ctx) = config.select(name.as_deref().or(cli.context.as_deref()))?;
            if *json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "context-show",
                    "name": name,
                    "context": ctx,
                })));
            }
            println!("# {}", name);
            print!("{}", serde_yaml::to_string(ctx)?);
        }
    }
    Ok(None)
}

fn default_config_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => Path::new(&home).join(".config").join("mrun").join("config.yaml"),
        None => PathBuf::from("mrun.yaml"),
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<DeployError>())
        .map(DeployError::code)
        .unwrap_or("command_failed")
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Context(ContextCommands::List { json })
        | Commands::Context(ContextCommands::Show { json, .. }) => *json,
    }
}

fn context_to_json(name: &str, ctx: &BackendConfig, current: bool) -> Value {
    json!({
        "name": name,
        "backend": ctx.kind().as_str(),
        "storage_dir": ctx.storage_dir,
        "user_id": ctx.user_id,
        "current": current,
    })
}

fn print_receipt(receipt: &RunReceipt) {
    println!("experiment: {}", receipt.experiment);
    println!("backend: {}", receipt.backend.as_str());
    println!("target: {}", receipt.target);
    println!("submission: {}", receipt.submission);
    if !receipt.output.is_empty() {
        println!("output: {}", receipt.output);
    }
    println!("submitted_at: {}", receipt.submitted_at.to_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn run_collects_params_after_separator() {
        let cli = Cli::try_parse_from([
            "mrun", "--context", "plg", "run", "exp.yaml", "--json", "--", "--lr", "0.1",
        ])
        .expect("parse");
        assert_eq!(cli.context.as_deref(), Some("plg"));
        match cli.command {
            Commands::Run {
                spec, json, params, image,
            } => {
                assert_eq!(spec, PathBuf::from("exp.yaml"));
                assert!(json);
                assert!(image.is_none());
                assert_eq!(params, vec!["--lr", "0.1"]);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn global_flags_are_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["mrun", "context", "show", "gke", "--json", "--debug"])
            .expect("parse");
        assert!(cli.debug);
        assert!(command_json_mode(&cli.command));
    }

    #[test]
    fn deploy_errors_keep_their_code_through_context() {
        let err = anyhow::Error::new(DeployError::UnsupportedResource {
            kind: "tpu".to_string(),
        })
        .context("running experiment foo");
        assert_eq!(error_code(&err), "unsupported_resource");
        assert_eq!(error_code(&anyhow!("plain failure")), "command_failed");
    }

    #[test]
    fn context_listing_reads_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "current_context: gke\ncontexts:\n  gke:\n    backend_type: kubernetes\n    storage_dir: /storage\n    user_id: jj\n    registry_url: gcr.io/research\n",
        )
        .expect("write config");
        let cli = Cli::try_parse_from([
            "mrun",
            "--config",
            path.to_str().expect("utf8"),
            "context",
            "list",
            "--json",
        ])
        .expect("parse");
        let payload = run_command(&cli).expect("list").expect("json payload");
        assert_eq!(payload["contexts"][0]["name"], "gke");
        assert_eq!(payload["contexts"][0]["backend"], "orchestrated");
        assert_eq!(payload["contexts"][0]["current"], true);
    }
}

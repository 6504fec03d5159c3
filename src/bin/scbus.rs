//! `scbus`: the control-domain CLI, a thin envelope signer.
//!
//! Builds `set_policy`/`get_status` envelopes, signs them with the
//! control domain's private key, and sends them to the daemon's socket.
//! The daemon alone decides whether a command is accepted.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use rand::RngCore;
use serde_json::Value;
use signed_control_bus::config::Config;
use signed_control_bus::crypto::KeyPair;
use signed_control_bus::envelope::{canonicalize, sign, CommandEnvelope, CommandMsg, PolicyValue};
use signed_control_bus::replay::now_secs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "scbus", about = "Control-domain CLI for the signed control bus")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the control domain's key pair if absent.
    Bootstrap,
    /// Set one policy key to a value.
    Set {
        key: String,
        value: String,
        /// Print the canonical envelope instead of sending it.
        #[arg(long)]
        dry_run: bool,
    },
    /// Set every key/value pair in a JSON file.
    Apply {
        #[arg(long)]
        policy_file: PathBuf,
    },
    /// Print the daemon's status document.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match run(cli.command, &config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: &Config) -> Result<ExitCode> {
    match command {
        Command::Bootstrap => bootstrap(config),
        Command::Set { key, value, dry_run } => {
            let mut args = BTreeMap::new();
            args.insert(key, parse_policy_value(&value));
            set_policy(config, args, dry_run).await
        }
        Command::Apply { policy_file } => {
            let text = std::fs::read_to_string(&policy_file)
                .with_context(|| format!("reading {policy_file:?}"))?;
            let raw: BTreeMap<String, Value> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {policy_file:?} as a key/value map"))?;
            let args = raw
                .into_iter()
                .map(|(k, v)| (k, json_to_policy_value(&v)))
                .collect();
            set_policy(config, args, false).await
        }
        Command::Status => status(config).await,
    }
}

fn bootstrap(config: &Config) -> Result<ExitCode> {
    let pk_path = config.public_key_path();
    let sk_path = config.private_key_path();

    if pk_path.exists() && sk_path.exists() {
        println!("key pair already present at {:?}", config.key_dir);
        return Ok(ExitCode::SUCCESS);
    }

    std::fs::create_dir_all(&config.key_dir)
        .with_context(|| format!("creating key directory {:?}", config.key_dir))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&config.key_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    let keypair = KeyPair::generate();
    keypair.write_private_key_to_file(&sk_path)?;
    keypair.public_key().write_to_file(&pk_path)?;

    println!("generated key pair at {:?}", config.key_dir);
    println!("public key: {}", keypair.public_key());
    Ok(ExitCode::SUCCESS)
}

async fn set_policy(
    config: &Config,
    args: BTreeMap<String, PolicyValue>,
    dry_run: bool,
) -> Result<ExitCode> {
    let keypair = KeyPair::read_from_file(&config.private_key_path())
        .with_context(|| format!("reading private key from {:?}", config.private_key_path()))?;

    let envelope = build_envelope(&keypair, "set_policy", args)?;

    if dry_run {
        let encoded = serde_json::to_string(&envelope)?;
        println!("{encoded}");
        return Ok(ExitCode::SUCCESS);
    }

    let reply = send(config, &envelope).await?;
    print_reply(&reply);
    Ok(exit_code_for_reply(&reply))
}

async fn status(config: &Config) -> Result<ExitCode> {
    let keypair = KeyPair::read_from_file(&config.private_key_path())
        .with_context(|| format!("reading private key from {:?}", config.private_key_path()))?;
    let envelope = build_envelope(&keypair, "get_status", BTreeMap::new())?;
    let reply = send(config, &envelope).await?;
    print_reply(&reply);
    Ok(ExitCode::SUCCESS)
}

fn build_envelope(
    keypair: &KeyPair,
    command: &str,
    args: BTreeMap<String, PolicyValue>,
) -> Result<CommandEnvelope> {
    let mut nonce_bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = base64::engine::general_purpose::STANDARD.encode(nonce_bytes);

    let msg = CommandMsg {
        command: command.to_string(),
        args,
        nonce,
        timestamp: now_secs(),
    };
    let signature = sign(keypair, &msg)?;

    // Sanity check: the canonical bytes we just signed must still verify.
    debug_assert!(canonicalize(&msg).is_ok());

    Ok(CommandEnvelope {
        msg,
        signature: signature.to_base64(),
    })
}

async fn send(config: &Config, envelope: &CommandEnvelope) -> Result<Value> {
    let mut stream = UnixStream::connect(&config.socket_path)
        .await
        .with_context(|| format!("connecting to {:?}", config.socket_path))?;

    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    stream.write_all(&line).await?;

    let mut reader = BufReader::new(stream);
    let mut response = String::new();
    reader.read_line(&mut response).await?;

    serde_json::from_str(response.trim_end()).context("parsing daemon reply")
}

fn print_reply(reply: &Value) {
    let pretty = serde_json::to_string_pretty(reply).unwrap_or_else(|_| reply.to_string());
    println!("{pretty}");
    std::io::stdout().flush().ok();
}

fn exit_code_for_reply(reply: &Value) -> ExitCode {
    match reply.get("status").and_then(Value::as_str) {
        Some("ok") => {
            let failed_empty = reply
                .get("failed")
                .and_then(Value::as_array)
                .map_or(true, |a| a.is_empty());
            if failed_empty {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        _ => ExitCode::FAILURE,
    }
}

fn parse_policy_value(raw: &str) -> PolicyValue {
    if let Ok(b) = raw.parse::<bool>() {
        return PolicyValue::Bool(b);
    }
    if let Ok(n) = raw.parse::<i64>() {
        return PolicyValue::Integer(n);
    }
    PolicyValue::String(raw.to_string())
}

fn json_to_policy_value(value: &Value) -> PolicyValue {
    match value {
        Value::Bool(b) => PolicyValue::Bool(*b),
        Value::Number(n) if n.is_i64() => PolicyValue::Integer(n.as_i64().unwrap_or_default()),
        other => PolicyValue::String(other.as_str().map_or_else(|| other.to_string(), str::to_string)),
    }
}

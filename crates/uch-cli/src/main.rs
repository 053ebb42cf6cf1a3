mod config;
mod logging;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde_json::json;
use uch_core::clock::Clock;
use uch_core::digest::{Digest128, Md5Digest};
use uch_core::filetime::{filetime_to_regdate_hex, FileTime};
use uch_core::hash::format_canonical_string_at;
use uch_core::platform::Platform;
use uch_core::registry::Unverified;
use uch_core::store::RegistryHive;
use uch_core::{AssociationTarget, DefaultHandlerController, Failure, UserChoiceHasher, Verification};

use crate::config::Config;

#[derive(Debug, Parser)]
#[command(name = "uch", version, about = "Inspect and set per-user default handlers through UserChoice")]
struct Cli {
    /// Config file (default: $UCH_CONFIG, then %APPDATA%\UserChoiceKit\config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging on stderr (otherwise UCH_LOG, default warn)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compute a UserChoice hash without touching the registry
    Hash {
        /// Protocol (`https`) or extension (`.pdf`)
        target: String,
        #[arg(long)]
        sid: String,
        #[arg(long)]
        prog_id: String,
        /// FILETIME as 16 hex digits (default: now)
        #[arg(long, value_parser = parse_filetime)]
        filetime: Option<u64>,
        /// Use the CNG MD5 provider instead of the portable one
        #[arg(long)]
        cng: bool,
    },
    /// Print the stored UserChoice record without verifying it
    Read { target: String },
    /// Recompute the stored record's hash and compare
    Verify {
        target: String,
        /// SID to hash with (default: current user)
        #[arg(long)]
        sid: Option<String>,
    },
    IsDefault {
        target: String,
        #[arg(long)]
        prog_id: Option<String>,
    },
    /// Make this application the default handler for each target
    SetDefault {
        #[arg(required = true)]
        targets: Vec<String>,
        #[arg(long)]
        prog_id: Option<String>,
    },
    Sysinfo,
    /// Print the effective configuration
    Config,
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Failure(#[from] Failure),
    #[error("config {}: {source}", path.display())]
    Config {
        path: PathBuf,
        source: std::io::Error,
    },
}

fn parse_filetime(s: &str) -> Result<u64, String> {
    let hex = s.trim();
    let hex = hex
        .strip_prefix("0x")
        .or_else(|| hex.strip_prefix("0X"))
        .unwrap_or(hex);
    if hex.is_empty() || hex.len() > 16 {
        return Err("expected up to 16 hex digits".to_string());
    }
    u64::from_str_radix(hex, 16).map_err(|e| e.to_string())
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init_tracing(cli.verbose);

    let config_path = cli.config.clone().unwrap_or_else(config::default_config_path);
    let result = config::load_config(&config_path)
        .map_err(|source| CliError::Config {
            path: config_path.clone(),
            source,
        })
        .and_then(|cfg| run(cli.command, &cfg, &config_path));

    match result {
        Ok(code) => code,
        Err(err) => {
            eprintln!("uch failed: {}", err);
            ExitCode::from(1)
        }
    }
}

fn run(command: Command, cfg: &Config, config_path: &std::path::Path) -> Result<ExitCode, CliError> {
    match command {
        Command::Hash {
            target,
            sid,
            prog_id,
            filetime,
            cng,
        } => {
            let target = AssociationTarget::new(&target)?;
            let ft = match filetime {
                Some(v) => FileTime::from_u64(v),
                None => FileTime::from_system_time(std::time::SystemTime::now())?,
            };
            if cng {
                #[cfg(windows)]
                {
                    let hasher = UserChoiceHasher::with_digest(uch_core::digest::CngMd5Digest);
                    return cmd_hash(&hasher, &target, &sid, &prog_id, ft);
                }
                #[cfg(not(windows))]
                return Err(Failure::WindowsOnly.into());
            }
            cmd_hash(&UserChoiceHasher::<Md5Digest>::default(), &target, &sid, &prog_id, ft)
        }
        Command::Read { target } => {
            let target = AssociationTarget::new(&target)?;
            with_session(cfg, None, |s| cmd_read(s, &target))
        }
        Command::Verify { target, sid } => {
            let target = AssociationTarget::new(&target)?;
            with_session(cfg, None, |s| cmd_verify(s, &target, sid.as_deref()))
        }
        Command::IsDefault { target, prog_id } => {
            let target = AssociationTarget::new(&target)?;
            with_session(cfg, prog_id.as_deref(), |s| cmd_is_default(s, &target))
        }
        Command::SetDefault { targets, prog_id } => {
            let targets = targets
                .iter()
                .map(|t| AssociationTarget::new(t))
                .collect::<Result<Vec<_>, _>>()?;
            let audit = cfg.audit_log_path();
            with_session(cfg, prog_id.as_deref(), |s| cmd_set_default(s, &targets, &audit))
        }
        Command::Sysinfo => {
            let info = uch_core::sysinfo::read_sysinfo(cfg.minimum_build)?;
            println!("{}", json!(info));
            Ok(ExitCode::SUCCESS)
        }
        Command::Config => {
            println!(
                "{}",
                json!({
                    "path": config_path.to_string_lossy(),
                    "exists": config_path.exists(),
                    "config": cfg,
                    "audit_log": cfg.audit_log_path().to_string_lossy(),
                })
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[cfg(windows)]
fn with_session<F>(cfg: &Config, prog_id: Option<&str>, f: F) -> Result<ExitCode, CliError>
where
    F: FnOnce(
        &DefaultHandlerController<
            uch_core::store::CurrentUserHive,
            uch_core::clock::SystemClock,
            uch_core::platform::WindowsPlatform,
        >,
    ) -> Result<ExitCode, CliError>,
{
    use uch_core::{ControllerOptions, UserChoiceRegistry};

    let identity = cfg.identity(prog_id)?;
    let registry = UserChoiceRegistry::new(
        uch_core::store::CurrentUserHive::open(),
        uch_core::clock::SystemClock,
        UserChoiceHasher::<Md5Digest>::default(),
    )
    .with_write_threshold(cfg.write_threshold());
    let controller = DefaultHandlerController::new(registry, uch_core::platform::WindowsPlatform, identity)
        .with_options(ControllerOptions {
            minimum_build: cfg.minimum_build,
        });
    f(&controller)
}

/// Everything below needs HKCU and the shell.
#[cfg(not(windows))]
fn with_session<F>(cfg: &Config, prog_id: Option<&str>, f: F) -> Result<ExitCode, CliError>
where
    F: FnOnce(
        &DefaultHandlerController<
            uch_core::store::MemoryHive,
            uch_core::clock::SystemClock,
            &'static dyn Platform,
        >,
    ) -> Result<ExitCode, CliError>,
{
    let _ = (cfg, prog_id, f);
    Err(Failure::WindowsOnly.into())
}

fn cmd_hash<D: Digest128>(
    hasher: &UserChoiceHasher<D>,
    target: &AssociationTarget,
    sid: &str,
    prog_id: &str,
    ft: FileTime,
) -> Result<ExitCode, CliError> {
    let hash = hasher.generate_at(target.as_str(), sid, prog_id, ft)?;
    println!(
        "{}",
        json!({
            "target": target.as_str(),
            "sid": sid,
            "prog_id": prog_id,
            "filetime": filetime_to_regdate_hex(ft.truncate_to_minute().as_u64()),
            "input": format_canonical_string_at(target.as_str(), sid, prog_id, ft),
            "hash": hash,
        })
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_read<S, C, P>(
    s: &DefaultHandlerController<S, C, P>,
    target: &AssociationTarget,
) -> Result<ExitCode, CliError>
where
    S: RegistryHive,
    C: Clock,
    P: Platform,
{
    let line = match s.registry().read_user_choice(target)? {
        None => json!({
            "target": target.as_str(),
            "status": "NOT_SET",
            "prog_id": null,
            "hash": null,
            "last_write_time_filetime": null,
        }),
        Some(uc) => json!({
            "target": target.as_str(),
            "status": "OK",
            "prog_id": uc.prog_id,
            "hash": uc.hash,
            "last_write_time_filetime": uc.last_write_time.as_u64(),
        }),
    };
    println!("{}", line);
    Ok(ExitCode::SUCCESS)
}

fn cmd_verify<S, C, P>(
    s: &DefaultHandlerController<S, C, P>,
    target: &AssociationTarget,
    sid: Option<&str>,
) -> Result<ExitCode, CliError>
where
    S: RegistryHive,
    C: Clock,
    P: Platform,
{
    let sid = match sid {
        Some(sid) => sid.to_string(),
        None => s.platform().user_sid()?,
    };
    let (ok, line) = match s.registry().verify_stored_hash(target, &sid)? {
        Verification::Verified(record) => (
            true,
            json!({
                "target": target.as_str(),
                "sid": sid,
                "status": "VERIFIED",
                "prog_id": record.prog_id,
                "hash": record.hash,
            }),
        ),
        Verification::Unverified(reason) => {
            let (stored, computed) = match &reason {
                Unverified::Mismatch { stored, computed } => (Some(stored.clone()), Some(computed.clone())),
                _ => (None, None),
            };
            (
                false,
                json!({
                    "target": target.as_str(),
                    "sid": sid,
                    "status": "UNVERIFIED",
                    "reason": reason.into_failure(target).to_string(),
                    "stored_hash": stored,
                    "computed_hash": computed,
                }),
            )
        }
    };
    println!("{}", line);
    Ok(if ok { ExitCode::SUCCESS } else { ExitCode::from(1) })
}

fn cmd_is_default<S, C, P>(
    s: &DefaultHandlerController<S, C, P>,
    target: &AssociationTarget,
) -> Result<ExitCode, CliError>
where
    S: RegistryHive,
    C: Clock,
    P: Platform,
{
    let current = s.platform().current_default(target).unwrap_or_else(|err| {
        tracing::warn!(target = %target, error = %err, "current default query failed");
        None
    });
    println!(
        "{}",
        json!({
            "target": target.as_str(),
            "prog_id": s.identity().prog_id(),
            "is_default": s.is_default(target),
            "current_default": current,
        })
    );
    Ok(ExitCode::SUCCESS)
}

fn cmd_set_default<S, C, P>(
    s: &DefaultHandlerController<S, C, P>,
    targets: &[AssociationTarget],
    audit: &std::path::Path,
) -> Result<ExitCode, CliError>
where
    S: RegistryHive,
    C: Clock,
    P: Platform,
{
    let mut failed = false;
    for target in targets {
        let result = s.try_set_default(target);
        failed |= result.is_err();
        let record = logging::set_default_record(
            logging::unix_time_ms(),
            target,
            s.identity().prog_id(),
            &result,
        );
        println!("{}", record);
        if let Err(err) = logging::append_record(audit, &record) {
            tracing::warn!(path = %audit.display(), error = %err, "audit log write failed");
        }
    }
    Ok(if failed { ExitCode::from(1) } else { ExitCode::SUCCESS })
}

//! jailrun-oracle - fixed-behaviour enforcement tool for demos and tests
//!
//! Reads framed [`ToolMessage`]s on stdin and answers every event on stdout.
//! A path under a `--terminate` prefix, or a syscall named by
//! `--terminate-syscall`, gets `Terminate`; a path under a `--deny` prefix gets
//! `Deny`; everything else is allowed. Prefixes match whole components of the
//! resolved path, and of unix socket addresses. While any prefix is set, a
//! path the runner could not resolve is denied.

use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use jailrun::notify::channel::{PROTOCOL_VERSION, read_frame, write_frame};
use jailrun::{Operation, PolicyVerdict, ToolMessage, VerdictMessage};

#[derive(Parser)]
#[command(name = "jailrun-oracle")]
#[command(author, version, about = "Reference enforcement tool for jailrun")]
struct Oracle {
    /// Deny operations on paths under this prefix (repeatable)
    #[arg(long, value_name = "PATH")]
    deny: Vec<PathBuf>,

    /// Terminate the sandbox on paths under this prefix (repeatable)
    #[arg(long, value_name = "PATH")]
    terminate: Vec<PathBuf>,

    /// Terminate the sandbox when this syscall is attempted (repeatable)
    #[arg(long = "terminate-syscall", value_name = "NAME")]
    terminate_syscall: Vec<String>,

    /// Print each decision to stderr
    #[arg(long)]
    log: bool,
}

impl Oracle {
    fn decide(&self, op: &Operation) -> PolicyVerdict {
        if self.terminate_syscall.iter().any(|name| *name == op.syscall) {
            return PolicyVerdict::Terminate(format!("{} is forbidden", op.syscall));
        }
        let names: Vec<&str> = op
            .paths()
            .chain(op.addresses().filter(|addr| addr.starts_with('/')))
            .collect();
        for path in &names {
            if let Some(prefix) = under(path, &self.terminate) {
                return PolicyVerdict::Terminate(format!("{path} is under {}", prefix.display()));
            }
        }
        for path in &names {
            if let Some(prefix) = under(path, &self.deny) {
                return PolicyVerdict::Deny(format!("{path} is under {}", prefix.display()));
            }
        }
        let restricted = !self.deny.is_empty() || !self.terminate.is_empty();
        if let Some(path) = names.iter().find(|path| restricted && !path.starts_with('/')) {
            return PolicyVerdict::Deny(format!("{path} could not be resolved"));
        }
        PolicyVerdict::Allow
    }
}

fn under<'a>(path: &str, prefixes: &'a [PathBuf]) -> Option<&'a Path> {
    prefixes
        .iter()
        .find(|prefix| Path::new(path).starts_with(prefix))
        .map(PathBuf::as_path)
}

fn main() -> anyhow::Result<()> {
    let oracle = Oracle::parse();

    let level = if oracle.log {
        tracing_subscriber::filter::LevelFilter::INFO
    } else {
        tracing_subscriber::filter::LevelFilter::WARN
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let mut input = BufReader::new(io::stdin().lock());
    let mut output = BufWriter::new(io::stdout().lock());

    while let Some(message) = read_frame::<_, ToolMessage>(&mut input).context("read event")? {
        match message {
            ToolMessage::Hello {
                version,
                session,
                pid,
            } => {
                if version != PROTOCOL_VERSION {
                    anyhow::bail!("unsupported protocol version {version}");
                }
                tracing::info!(%session, pid, "session started");
            }
            ToolMessage::Event(event) => {
                let verdict = oracle.decide(&event.op);
                tracing::info!(tid = event.tid, seq = event.seq, op = %event.op, ?verdict, "decision");
                write_frame(
                    &mut output,
                    &VerdictMessage {
                        tid: event.tid,
                        seq: event.seq,
                        verdict,
                    },
                )
                .context("write verdict")?;
                output.flush().context("flush verdict")?;
            }
        }
    }
    Ok(())
}

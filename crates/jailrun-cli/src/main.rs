//! jailrun CLI - run one command in the sandbox and exit with its outcome

use std::io;
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::Parser;
use jailrun::report::report;
use jailrun::{CgroupLimits, Launcher, MountEntry, SandboxError, SandboxRequest, SetupError, split_command};

#[derive(Parser)]
#[command(name = "jailrun")]
#[command(author, version, about = "Run a command in an isolated mount view under an enforcement tool")]
struct Cli {
    /// Command line, split on ASCII whitespace
    #[arg(short, long)]
    command: String,

    /// Sandbox root directory
    #[arg(short, long)]
    mount: PathBuf,

    /// Target uid (the gid is the same number)
    #[arg(short, long)]
    uid: u32,

    /// Bind entry host:guest[:ro|:rw] (repeatable)
    #[arg(short, long = "add", value_name = "HOST:GUEST[:ro]")]
    add: Vec<MountEntry>,

    /// Enforcement tool binary
    #[arg(short, long)]
    tool: PathBuf,

    /// Argument forwarded to the tool (repeatable)
    #[arg(long = "tool-arg", value_name = "ARG", allow_hyphen_values = true)]
    tool_arg: Vec<String>,

    /// Wall-clock budget in seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Environment variable KEY=VALUE (repeatable)
    #[arg(long, value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Working directory inside the sandbox
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// UTS hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Keep the host network namespace
    #[arg(long)]
    share_net: bool,

    /// RLIMIT_NOFILE
    #[arg(long)]
    nofile: Option<u64>,

    /// RLIMIT_NPROC
    #[arg(long)]
    max_procs: Option<u64>,

    /// RLIMIT_DATA, in bytes or with a K/M/G suffix
    #[arg(long, value_parser = parse_size)]
    memory: Option<u64>,

    /// Run without a session cgroup
    #[arg(long, conflicts_with_all = ["cgroup_memory", "cgroup_pids", "cgroup_cpu_weight", "cgroup_io_weight"])]
    no_cgroup: bool,

    /// Cgroup memory.max, in bytes or with a K/M/G suffix [default: 1G]
    #[arg(long, value_parser = parse_size, value_name = "SIZE")]
    cgroup_memory: Option<u64>,

    /// Cgroup pids.max [default: 64]
    #[arg(long, value_name = "N")]
    cgroup_pids: Option<u64>,

    /// Cgroup cpu.weight, 1-10000 [default: 256]
    #[arg(long, value_name = "WEIGHT")]
    cgroup_cpu_weight: Option<u32>,

    /// Cgroup io.weight, 1-10000 [default: 50]
    #[arg(long, value_name = "WEIGHT")]
    cgroup_io_weight: Option<u32>,

    /// Debug logging
    #[arg(short, long)]
    debug: bool,
}

fn parse_env(s: &str) -> anyhow::Result<(String, String)> {
    let Some((key, value)) = s.split_once('=') else {
        bail!("expected KEY=VALUE, got {s:?}");
    };
    if key.is_empty() {
        bail!("empty variable name in {s:?}");
    }
    Ok((key.to_owned(), value.to_owned()))
}

fn parse_size(s: &str) -> anyhow::Result<u64> {
    let (digits, shift) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 10),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 20),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid size {s:?}"))?;
    value
        .checked_mul(1 << shift)
        .with_context(|| format!("size {s:?} overflows"))
}

impl Cli {
    fn request(self) -> Result<SandboxRequest, SandboxError> {
        let mut builder = SandboxRequest::builder(
            split_command(&self.command),
            self.mount,
            self.uid,
            self.tool,
        )
        .entries(self.add)
        .share_net(self.share_net);

        for arg in self.tool_arg {
            builder = builder.tool_arg(arg);
        }
        for (key, value) in self.env {
            builder = builder.env(key, value);
        }
        if let Some(secs) = self.timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        if let Some(workdir) = self.workdir {
            builder = builder.workdir(workdir);
        }
        if let Some(hostname) = self.hostname {
            builder = builder.hostname(hostname);
        }
        if let Some(nofile) = self.nofile {
            builder = builder.nofile(nofile);
        }
        if let Some(max) = self.max_procs {
            builder = builder.max_procs(max);
        }
        if let Some(bytes) = self.memory {
            builder = builder.memory(bytes);
        }
        builder = builder.cgroup((!self.no_cgroup).then(|| {
            let defaults = CgroupLimits::default();
            CgroupLimits {
                memory_max: self.cgroup_memory.unwrap_or(defaults.memory_max),
                pids_max: self.cgroup_pids.unwrap_or(defaults.pids_max),
                cpu_weight: self.cgroup_cpu_weight.unwrap_or(defaults.cpu_weight),
                io_weight: self.cgroup_io_weight.unwrap_or(defaults.io_weight),
            }
        }));

        builder.build().map_err(|e| SetupError::Validation(e).into())
    }
}

fn main() {
    let cli = Cli::parse();

    let directive = if cli.debug { "jailrun=debug" } else { "jailrun=info" };
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        directive
            .parse()
            .unwrap_or_else(|_| tracing_subscriber::filter::LevelFilter::INFO.into()),
    );
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let outcome = cli.request().and_then(|request| {
        tracing::debug!(argv = ?request.argv(), root = %request.mount_root().display(), "request");
        Launcher::new().run(&request)
    });
    let code = report(&outcome, &mut io::stderr());
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_full_command_line() {
        let cli = Cli::try_parse_from([
            "jailrun",
            "-c",
            "/bin/pwd -L",
            "-m",
            "/srv/root",
            "-u",
            "1000",
            "-a",
            "./src:/tmp/lim",
            "-a",
            "/data:/data:ro",
            "-t",
            "/usr/bin/jailrun-oracle",
            "--tool-arg",
            "--deny",
            "--tool-arg",
            "/tmp/lim/secret",
            "--timeout",
            "5",
            "--env",
            "FOO=bar=baz",
            "--memory",
            "64M",
        ])
        .unwrap();

        assert_eq!(cli.add.len(), 2);
        assert!(cli.add[1].read_only);
        assert_eq!(cli.tool_arg, ["--deny", "/tmp/lim/secret"]);
        assert_eq!(cli.env, [("FOO".to_owned(), "bar=baz".to_owned())]);
        assert_eq!(cli.memory, Some(64 << 20));

        let request = cli.request().unwrap();
        assert_eq!(request.argv(), ["/bin/pwd", "-L"]);
        assert_eq!(request.timeout(), Some(Duration::from_secs(5)));
        assert_eq!(request.limits().cgroup, Some(CgroupLimits::default()));
    }

    #[test]
    fn cgroup_flags() {
        let base = ["jailrun", "-c", "true", "-m", "/r", "-u", "0", "-t", "/t"];
        let cli = Cli::try_parse_from(
            base.iter()
                .copied()
                .chain(["--cgroup-memory", "256M", "--cgroup-pids", "16"]),
        )
        .unwrap();
        let limits = cli.request().unwrap().limits().cgroup.unwrap();
        assert_eq!(limits.memory_max, 256 << 20);
        assert_eq!(limits.pids_max, 16);
        assert_eq!(limits.cpu_weight, 256);

        let cli = Cli::try_parse_from(base.iter().copied().chain(["--no-cgroup"])).unwrap();
        assert_eq!(cli.request().unwrap().limits().cgroup, None);

        let conflict = Cli::try_parse_from(
            base.iter()
                .copied()
                .chain(["--no-cgroup", "--cgroup-pids", "8"]),
        );
        assert!(conflict.is_err());

        let cli = Cli::try_parse_from(base.iter().copied().chain(["--cgroup-io-weight", "0"])).unwrap();
        assert!(matches!(
            cli.request(),
            Err(SandboxError::Setup(SetupError::Validation(_)))
        ));
    }

    #[test]
    fn malformed_add_is_usage_error() {
        let err = Cli::try_parse_from([
            "jailrun", "-c", "true", "-m", "/r", "-u", "0", "-t", "/t", "-a", "/only-host",
        ])
        .err()
        .unwrap();
        assert_eq!(err.exit_code(), jailrun::report::EXIT_USAGE);
    }

    #[test]
    fn empty_command_is_setup_error() {
        let cli = Cli::try_parse_from(["jailrun", "-c", "   ", "-m", "/r", "-u", "0", "-t", "/t"]).unwrap();
        let outcome: Result<jailrun::SandboxResult, SandboxError> =
            cli.request().map(|_| unreachable!("empty command accepted"));
        assert_eq!(
            jailrun::report::exit_code(&outcome),
            jailrun::report::EXIT_SETUP
        );
    }

    #[test]
    fn sizes_and_env() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("2k").unwrap(), 2048);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("99999999999G").is_err());
        assert!(parse_env("NOVALUE").is_err());
        assert!(parse_env("=x").is_err());
        assert_eq!(parse_env("A=").unwrap(), ("A".into(), String::new()));
    }
}

//! sut-run - run one command on a system under test.
//!
//! Brings the SUT up, runs the command through its channel, prints the
//! output and tears the SUT down again. A graceful stop that fails is
//! escalated to a forced one.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sut_harness::{create_sut, CommandOutput, QemuConfig, QemuOptions, Sut, SutKind};

#[derive(Parser)]
#[command(name = "sut-run")]
#[command(about = "Run a command on the host or inside a QEMU virtual machine")]
struct Cli {
    /// Verbose logging (debug level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print the command result as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Command timeout in seconds
    #[arg(long, global = true, default_value_t = 3600)]
    timeout: u64,

    /// Stop timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    stop_timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the command on the local host
    Host {
        /// Command line to execute
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },

    /// Boot a virtual machine and run the command inside it
    Qemu {
        #[command(flatten)]
        vm: VmArgs,

        /// Command line to execute
        #[arg(trailing_var_arg = true, required = true)]
        cmd: Vec<String>,
    },
}

#[derive(Args)]
struct VmArgs {
    /// TOML file with virtual machine options (flags override it)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory for console logs and transport files
    #[arg(long)]
    tmpdir: Option<PathBuf>,

    /// Disk image to boot
    #[arg(long)]
    image: Option<PathBuf>,

    /// Boot a copy of the image written to this path
    #[arg(long)]
    image_overlay: Option<PathBuf>,

    /// Secondary read-only image
    #[arg(long)]
    ro_image: Option<PathBuf>,

    #[arg(long)]
    user: Option<String>,

    #[arg(long)]
    password: Option<String>,

    /// Memory size (e.g. 2G)
    #[arg(long)]
    ram: Option<String>,

    /// Number of virtual CPUs
    #[arg(long)]
    smp: Option<String>,

    /// Host directory mounted read-only on /mnt
    #[arg(long)]
    virtfs: Option<PathBuf>,

    /// Serial transport (isa, virtio)
    #[arg(long)]
    serial: Option<String>,

    /// Guest architecture
    #[arg(long)]
    system: Option<String>,

    /// Extra QEMU option (repeatable)
    #[arg(long = "option")]
    options: Vec<String>,
}

impl VmArgs {
    fn into_options(self) -> Result<QemuOptions> {
        let mut options = match &self.config {
            Some(path) => QemuOptions::from_toml_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => QemuOptions::default(),
        };

        if self.tmpdir.is_some() {
            options.tmpdir = self.tmpdir;
        }
        if self.image.is_some() {
            options.image = self.image;
        }
        if self.image_overlay.is_some() {
            options.image_overlay = self.image_overlay;
        }
        if self.ro_image.is_some() {
            options.ro_image = self.ro_image;
        }
        if self.virtfs.is_some() {
            options.virtfs = self.virtfs;
        }
        if let Some(user) = self.user {
            options.user = user;
        }
        if let Some(password) = self.password {
            options.password = password;
        }
        if let Some(ram) = self.ram {
            options.ram = ram;
        }
        if let Some(smp) = self.smp {
            options.smp = smp;
        }
        if let Some(serial) = self.serial {
            options.serial = serial;
        }
        if let Some(system) = self.system {
            options.system = system;
        }
        options.options.extend(self.options);

        Ok(options)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let (kind, cmd) = match cli.command {
        Commands::Host { cmd } => (SutKind::Host, cmd),
        Commands::Qemu { vm, cmd } => {
            let config = QemuConfig::new(vm.into_options()?)
                .context("Invalid virtual machine configuration")?;
            (SutKind::Qemu(Box::new(config)), cmd)
        }
    };

    let command = cmd.join(" ");
    let sut = create_sut(kind);
    let timeout = Duration::from_secs(cli.timeout);
    let stop_timeout = Duration::from_secs(cli.stop_timeout);

    let result = run(&*sut, &command, timeout);
    let stopped = shutdown(&*sut, stop_timeout);

    let output = result?;
    stopped?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print!("{}", output.stdout);
        let status = if output.success() {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        eprintln!(
            "{} exit code {} ({:.1}s)",
            status, output.returncode, output.exec_time
        );
    }

    if !output.success() {
        std::process::exit(output.returncode.clamp(1, 255));
    }
    Ok(())
}

fn run(sut: &dyn Sut, command: &str, timeout: Duration) -> Result<CommandOutput> {
    eprintln!("{} {}", "Starting".cyan().bold(), sut.name());
    let start = Instant::now();

    sut.communicate(None)
        .with_context(|| format!("Failed to bring up {}", sut.name()))?;
    eprintln!(
        "{} {} is up ({:.1}s)",
        "✓".green().bold(),
        sut.name(),
        start.elapsed().as_secs_f64()
    );

    let Some(channel) = sut.channel() else {
        bail!("{} has no command channel", sut.name());
    };

    channel
        .run_cmd(command, timeout, None)
        .with_context(|| format!("Failed to run '{}'", command))
}

fn shutdown(sut: &dyn Sut, timeout: Duration) -> Result<()> {
    match sut.stop(timeout) {
        Ok(()) => Ok(()),
        Err(err) => {
            eprintln!(
                "{} {} did not stop: {}, forcing",
                "!".yellow().bold(),
                sut.name(),
                err
            );
            sut.force_stop(timeout)
                .with_context(|| format!("Failed to force stop {}", sut.name()))
        }
    }
}

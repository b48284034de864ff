use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use ringcap_common::Encoding;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Record shape selected for the capture hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    Raw,
    Parameterized,
    Structured,
}

/// TC attach direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Ingress,
    Egress,
}

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Record shape produced by the hook.
    #[serde(default = "default_encoding")]
    pub encoding: EncodingKind,

    /// Payload bytes per record for the parameterized encoding. Unset means
    /// the default of 128.
    #[serde(default)]
    pub capture_size: Option<u16>,

    /// In-process ring buffer size in bytes (power of two).
    #[serde(default = "default_ring_size")]
    pub ring_size: usize,

    /// Number of packets pushed through the hook by `bench`.
    #[serde(default = "default_events")]
    pub events: usize,

    /// Simulated processing contexts used by `bench`.
    #[serde(default = "default_producers")]
    pub producers: usize,

    /// Per-read timeout when waiting for ring data, in milliseconds.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Network interface to attach the TC classifier on.
    #[serde(default)]
    pub interface: Option<String>,

    /// Attach to ingress or egress.
    #[serde(default = "default_direction")]
    pub direction: Direction,

    /// Path of the compiled kernel object.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: PathBuf,

    /// Write metrics in OpenMetrics text format here on exit.
    #[serde(default)]
    pub metrics_path: Option<PathBuf>,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Print the summary as JSON.
    #[serde(default)]
    pub json: bool,
}

fn default_encoding() -> EncodingKind {
    EncodingKind::Raw
}

fn default_capture_size() -> u16 {
    128
}

fn default_ring_size() -> usize {
    1 << 30
}

fn default_events() -> usize {
    50_000
}

fn default_producers() -> usize {
    1
}

fn default_read_timeout_ms() -> u64 {
    5
}

fn default_direction() -> Direction {
    Direction::Ingress
}

fn default_ebpf_object() -> PathBuf {
    PathBuf::from("ringcap-ebpf/target/bpfel-unknown-none/release/ringcap")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoding: default_encoding(),
            capture_size: None,
            ring_size: default_ring_size(),
            events: default_events(),
            producers: default_producers(),
            read_timeout_ms: default_read_timeout_ms(),
            interface: None,
            direction: default_direction(),
            ebpf_object: default_ebpf_object(),
            metrics_path: None,
            quiet: false,
            json: false,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if let Some(encoding) = cli.encoding {
            self.encoding = encoding;
        }
        if let Some(capture_size) = cli.capture_size {
            self.capture_size = Some(capture_size);
        }
        if let Some(ring_size) = cli.ring_size {
            self.ring_size = ring_size;
        }
        if let Some(path) = &cli.metrics_path {
            self.metrics_path = Some(path.clone());
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.json {
            self.json = true;
        }
        match &cli.command {
            Command::Bench {
                events,
                producers,
                read_timeout,
            } => {
                if let Some(events) = events {
                    self.events = *events;
                }
                if let Some(producers) = producers {
                    self.producers = *producers;
                }
                if let Some(timeout) = read_timeout {
                    self.read_timeout_ms = *timeout;
                }
            }
            Command::Attach {
                interface,
                direction,
                ebpf_object,
            } => {
                if interface.is_some() {
                    self.interface = interface.clone();
                }
                if let Some(direction) = direction {
                    self.direction = *direction;
                }
                if let Some(path) = ebpf_object {
                    self.ebpf_object = path.clone();
                }
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.ring_size.is_power_of_two(),
            "ring_size must be a power of two (got {})",
            self.ring_size
        );
        anyhow::ensure!(self.events > 0, "event count must be > 0 (got {})", self.events);
        anyhow::ensure!(
            (1..=usize::from(u16::MAX)).contains(&self.producers),
            "producers must be between 1 and {} (got {})",
            u16::MAX,
            self.producers
        );
        if let Some(capture_size) = self.ignored_capture_size() {
            tracing::warn!(
                "capture_size {} is ignored by the {:?} encoding",
                capture_size,
                self.encoding
            );
        }
        Ok(())
    }

    /// Effective payload size of the parameterized encoding.
    pub fn capture_size(&self) -> u16 {
        self.capture_size.unwrap_or_else(default_capture_size)
    }

    /// An explicitly set capture size that the selected encoding ignores.
    pub fn ignored_capture_size(&self) -> Option<u16> {
        match self.encoding {
            EncodingKind::Parameterized => None,
            EncodingKind::Raw | EncodingKind::Structured => self.capture_size,
        }
    }

    /// Wire encoding shared by the hook and the decoder.
    pub fn encoding(&self) -> Encoding {
        match self.encoding {
            EncodingKind::Raw => Encoding::Raw,
            EncodingKind::Parameterized => Encoding::Parameterized {
                capture_size: self.capture_size(),
            },
            EncodingKind::Structured => Encoding::Structured,
        }
    }
}

/// ringcap: packet capture into a BPF-style ring buffer
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to YAML config file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Record encoding.
    #[arg(short, long, global = true, value_enum)]
    pub encoding: Option<EncodingKind>,

    /// Payload bytes per record (parameterized encoding).
    #[arg(short = 's', long, global = true)]
    pub capture_size: Option<u16>,

    /// In-process ring buffer size in bytes.
    #[arg(long, global = true)]
    pub ring_size: Option<usize>,

    /// Write metrics to this file on exit.
    #[arg(long, global = true)]
    pub metrics_path: Option<PathBuf>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long, global = true)]
    pub quiet: bool,

    /// Print the summary as JSON.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run the hook over a sample packet into an in-process ring and parse
    /// the records back.
    Bench {
        /// Number of ring buffer events to generate and parse.
        #[arg(short = 'n', long)]
        events: Option<usize>,

        /// Simulated processing contexts producing concurrently.
        #[arg(short, long)]
        producers: Option<usize>,

        /// Per-read timeout when waiting for ring data, in milliseconds.
        #[arg(long)]
        read_timeout: Option<u64>,
    },
    /// Load the kernel object, attach the classifier and drain its ring.
    Attach {
        /// Network interface to attach to (e.g., eth0).
        #[arg(short, long)]
        interface: Option<String>,

        /// Attach direction.
        #[arg(short, long, value_enum)]
        direction: Option<Direction>,

        /// Path of the compiled kernel object.
        #[arg(long)]
        ebpf_object: Option<PathBuf>,
    },
}

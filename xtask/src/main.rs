use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_TARGET: &str = "bpfel-unknown-none";

#[derive(Parser)]
enum Cli {
    /// Build the classifiers for bpfel-unknown-none.
    BuildEbpf {
        #[arg(long)]
        release: bool,
    },
    /// Build the kernel object, then the workspace.
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Build everything and run `ringcap attach` with sudo against the
    /// freshly built kernel object.
    Run {
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to `ringcap attach`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_workspace(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_workspace(release)?;
            run_attach(release, &args)
        }
    }
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..")
}

/// Path of the classifier object produced by `build_ebpf`.
fn ebpf_object(release: bool) -> PathBuf {
    workspace_root()
        .join("ringcap-ebpf/target")
        .join(EBPF_TARGET)
        .join(profile(release))
        .join("ringcap")
}

fn cargo(dir: &Path, args: &[&str], release: bool, what: &str) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(dir).args(args);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .with_context(|| format!("failed to run cargo build for {what}"))?;
    anyhow::ensure!(status.success(), "{what} build failed");
    Ok(())
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    cargo(
        &workspace_root().join("ringcap-ebpf"),
        &["+nightly", "build", "--target", EBPF_TARGET, "-Z", "build-std=core"],
        release,
        "ringcap-ebpf",
    )
}

fn build_workspace(release: bool) -> anyhow::Result<()> {
    cargo(&workspace_root(), &["build", "--workspace"], release, "workspace")
}

fn run_attach(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = workspace_root()
        .join("target")
        .join(profile(release))
        .join("ringcap");

    let status = Command::new("sudo")
        .arg(&bin)
        .arg("attach")
        .arg("--ebpf-object")
        .arg(ebpf_object(release))
        .args(extra_args)
        .status()
        .context("failed to run ringcap")?;
    anyhow::ensure!(status.success(), "ringcap exited with error");
    Ok(())
}

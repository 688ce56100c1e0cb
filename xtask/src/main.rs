//! xtask: Development tasks for shmif
//!
//! Run with: `cargo xtask <command>`

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use xshell::{cmd, Shell};

/// Fuzz harnesses under `fuzz/tests`.
const FUZZ_TARGETS: &[(&str, &str)] = &[
    ("event_ring", "EventRing push/pop against a hostile consumer"),
    ("lifecycle", "Segment lifecycle transitions"),
    ("negotiation", "Resize negotiation between both sides"),
];

/// Where Linux keeps POSIX shared memory objects and named semaphores.
const SHM_DIR: &str = "/dev/shm";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Development tasks for shmif")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run all tests (workspace + fuzz harnesses)
    Test,
    /// Run fuzz tests with bolero
    Fuzz {
        /// Target to fuzz (e.g., "event_ring", "lifecycle", "negotiation")
        /// If not specified, runs all fuzz harnesses in test mode (quick smoke test)
        target: Option<String>,
    },
    /// List segment objects left behind by crashed processes
    Leaks {
        /// Unlink them instead of just listing
        #[arg(long)]
        remove: bool,
    },
    /// Run clippy on all code
    Clippy,
    /// Check formatting
    Fmt {
        /// Fix formatting issues instead of just checking
        #[arg(long)]
        fix: bool,
    },
}

fn main() -> ExitCode {
    if let Err(e) = run() {
        eprintln!("Error: {e}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn workspace_root() -> Result<PathBuf, Box<dyn std::error::Error>> {
    let manifest_dir = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => std::env::current_dir()?.join("xtask"),
    };
    manifest_dir
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| "xtask has no parent directory".into())
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    let workspace_root = workspace_root()?;
    sh.change_dir(&workspace_root);

    match cli.command {
        Commands::Test => {
            println!("=== Running workspace tests ===");

            // Try nextest first, fall back to cargo test
            if cmd!(sh, "cargo nextest --version").quiet().run().is_ok() {
                println!("Using cargo-nextest");
                cmd!(sh, "cargo nextest run --workspace").run()?;
            } else {
                println!("cargo-nextest not found, using cargo test");
                cmd!(sh, "cargo test --workspace").run()?;
            }

            println!("\n=== Running fuzz harnesses (test mode) ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo test").run()?;

            println!("\n=== All tests passed ===");
        }
        Commands::Fuzz { target } => {
            sh.change_dir(workspace_root.join("fuzz"));

            if let Some(t) = target {
                if !FUZZ_TARGETS.iter().any(|(name, _)| *name == t) {
                    return Err(format!("unknown fuzz target: {t}").into());
                }
                println!("=== Fuzzing target: {t} ===");
                println!("Press Ctrl+C to stop.\n");

                if cmd!(sh, "cargo bolero --version").quiet().run().is_err() {
                    eprintln!("cargo-bolero not found. Install with:");
                    eprintln!("  cargo install cargo-bolero");
                    return Err("cargo-bolero not installed".into());
                }

                cmd!(sh, "cargo bolero test {t}").run()?;
            } else {
                println!("=== Running all fuzz harnesses in test mode ===");
                println!("(For real fuzzing, specify a target: cargo xtask fuzz event_ring)\n");
                println!("Available targets:");
                for (name, about) in FUZZ_TARGETS {
                    println!("  - {name:<12} ({about})");
                }
                println!();

                cmd!(sh, "cargo test").run()?;
            }
        }
        Commands::Leaks { remove } => leaks(Path::new(SHM_DIR), remove)?,
        Commands::Clippy => {
            println!("=== Running clippy ===");
            cmd!(sh, "cargo clippy --workspace --all-features -- -D warnings").run()?;

            println!("\n=== Running clippy on fuzz crate ===");
            sh.change_dir(workspace_root.join("fuzz"));
            cmd!(sh, "cargo clippy --all-targets -- -D warnings").run()?;
        }
        Commands::Fmt { fix } => {
            if fix {
                println!("=== Fixing formatting ===");
                cmd!(sh, "cargo fmt --all").run()?;
            } else {
                println!("=== Checking formatting ===");
                cmd!(sh, "cargo fmt --all -- --check").run()?;
            }
        }
    }

    Ok(())
}

/// Find segment memory objects (`shmif_*`) and their semaphores
/// (`sem.shmif_*`). Segments unlink their names once both sides are
/// attached, so anything found here belongs to a process that died early
/// or to a server that is still waiting for its client.
fn leaks(dir: &Path, remove: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("shmif_") || name.starts_with("sem.shmif_") {
            found.push(entry.path());
        }
    }
    found.sort();

    if found.is_empty() {
        println!("No segment objects in {}", dir.display());
        return Ok(());
    }

    for path in &found {
        if remove {
            std::fs::remove_file(path)?;
            println!("removed {}", path.display());
        } else {
            println!("{}", path.display());
        }
    }
    if !remove {
        println!("\n{} object(s); rerun with --remove to unlink them", found.len());
    }
    Ok(())
}

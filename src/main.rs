use anyhow::{Result, bail};
use clap::Parser;
use std::path::PathBuf;

use relocenv::bootstrap::write_bootstrap;
use relocenv::entrypoints::{list_entry_points, materialize_entry_points};
use relocenv::layout::{EnvLayout, Platform};
use relocenv::patch::{RelocationReport, make_relocatable};
use relocenv::runtime::{RealRuntime, relative_to};

/// relocenv - make Python virtual environments movable
///
/// Rewrites every artifact of an existing virtual environment that embeds
/// the environment's absolute creation path (script shebangs, binary
/// launchers, shell activation scripts, .pth/.egg-link metadata) into a
/// form that discovers its own location at run time. The pass is
/// idempotent: running it twice changes nothing.
///
/// Examples:
///   relocenv bootstrap ./venv   # Prepare an environment for relocation
///   relocenv patch ./venv       # Make every artifact self-locating
#[derive(Parser, Debug)]
#[command(author, version = env!("RELOCENV_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Target platform conventions (defaults to the host; also via RELOCENV_PLATFORM)
    #[arg(long, env = "RELOCENV_PLATFORM", value_enum, global = true)]
    pub platform: Option<PlatformArg>,

    /// Print results as JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum PlatformArg {
    Posix,
    Windows,
}

impl From<PlatformArg> for Platform {
    fn from(arg: PlatformArg) -> Self {
        match arg {
            PlatformArg::Posix => Platform::Posix,
            PlatformArg::Windows => Platform::Windows,
        }
    }
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Make every artifact of an environment self-locating
    Patch(PatchArgs),

    /// Write the activate_this.py bootstrap file into an environment
    Bootstrap(BootstrapArgs),

    /// List installed script entry points, optionally copying their
    /// launchers into a target directory and patching the copies
    EntryPoints(EntryPointsArgs),

    /// Print the relative path from one location to another
    Relpath(RelpathArgs),
}

#[derive(clap::Args, Debug)]
struct PatchArgs {
    /// Root directory of the virtual environment
    #[arg(value_name = "ENV")]
    env: PathBuf,
}

#[derive(clap::Args, Debug)]
struct BootstrapArgs {
    /// Root directory of the virtual environment
    #[arg(value_name = "ENV")]
    env: PathBuf,
}

#[derive(clap::Args, Debug)]
struct EntryPointsArgs {
    /// Root directory of the virtual environment
    #[arg(value_name = "ENV")]
    env: PathBuf,

    /// Only consider one installed distribution
    #[arg(long, short = 'p', value_name = "NAME")]
    package: Option<String>,

    /// Copy the launcher artifacts into this directory and patch the copies
    #[arg(long, value_name = "DIR")]
    into: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct RelpathArgs {
    /// File whose directory is the starting point
    #[arg(value_name = "FROM")]
    from: PathBuf,

    /// Destination path to express relatively
    #[arg(value_name = "TO")]
    to: PathBuf,

    /// Treat the destination as a file rather than a directory
    #[arg(long)]
    to_is_file: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;
    let platform = cli.platform.map(Platform::from).unwrap_or_else(Platform::host);

    match cli.command {
        Commands::Patch(args) => {
            let layout = EnvLayout::discover(&runtime, &args.env, platform)?;
            let report = make_relocatable(&runtime, &layout)?;
            print_report(&report, cli.json)?;
            let failed = report.counts().failed;
            if failed > 0 {
                bail!("{} artifact(s) could not be patched", failed);
            }
        }
        Commands::Bootstrap(args) => {
            let layout = EnvLayout::discover(&runtime, &args.env, platform)?;
            let path = write_bootstrap(&runtime, &layout)?;
            if cli.json {
                println!("{}", serde_json::json!({ "bootstrap": path }));
            } else {
                println!("{}", path.display());
            }
        }
        Commands::EntryPoints(args) => {
            let layout = EnvLayout::discover(&runtime, &args.env, platform)?;
            if let Some(target) = args.into {
                let report = materialize_entry_points(
                    &runtime,
                    &layout,
                    args.package.as_deref(),
                    &target,
                )?;
                print_report(&report, cli.json)?;
            } else {
                let entry_points =
                    list_entry_points(&runtime, &layout.lib_dirs, args.package.as_deref());
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&entry_points)?);
                } else {
                    for (dist, scripts) in &entry_points {
                        println!("{}: {}", dist, scripts.join(" "));
                    }
                }
            }
        }
        Commands::Relpath(args) => {
            println!("{}", relative_to(&args.from, &args.to, !args.to_is_file));
        }
    }
    Ok(())
}

fn print_report(report: &RelocationReport, json: bool) -> Result<()> {
    if json {
        let value = serde_json::json!({
            "artifacts": report.artifacts,
            "counts": report.counts(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }
    for artifact in &report.artifacts {
        println!("{}: {}", artifact.name, artifact.outcome);
    }
    let counts = report.counts();
    println!(
        "{} patched, {} already patched, {} unchanged, {} skipped, {} failed",
        counts.patched, counts.already_patched, counts.unchanged, counts.skipped, counts.failed
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_cli_patch_parsing() {
        let cli = Cli::try_parse_from(["relocenv", "patch", "/tmp/venv"]).unwrap();
        match cli.command {
            Commands::Patch(args) => assert_eq!(args.env, PathBuf::from("/tmp/venv")),
            _ => panic!("Expected Patch command"),
        }
        assert!(!cli.json);
    }

    #[test]
    fn test_cli_global_flags() {
        let cli =
            Cli::try_parse_from(["relocenv", "--json", "patch", "/tmp/venv", "--platform", "windows"])
                .unwrap();
        assert!(cli.json);
        assert!(matches!(cli.platform, Some(PlatformArg::Windows)));
    }

    #[test]
    fn test_cli_entry_points_parsing() {
        let cli = Cli::try_parse_from([
            "relocenv",
            "entry-points",
            "/tmp/venv",
            "--package",
            "pip",
            "--into",
            "/tmp/out",
        ])
        .unwrap();
        match cli.command {
            Commands::EntryPoints(args) => {
                assert_eq!(args.package.as_deref(), Some("pip"));
                assert_eq!(args.into, Some(PathBuf::from("/tmp/out")));
            }
            _ => panic!("Expected EntryPoints command"),
        }
    }

    #[test]
    fn test_cli_relpath_parsing() {
        let cli =
            Cli::try_parse_from(["relocenv", "relpath", "/a/b/file", "/a/c", "--to-is-file"])
                .unwrap();
        match cli.command {
            Commands::Relpath(args) => {
                assert_eq!(args.from, PathBuf::from("/a/b/file"));
                assert!(args.to_is_file);
            }
            _ => panic!("Expected Relpath command"),
        }
    }

    #[test]
    fn test_cli_no_subcommand_fails() {
        assert!(Cli::try_parse_from(["relocenv", "/tmp/venv"]).is_err());
    }
}

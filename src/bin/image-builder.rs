use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use image_builder::flavor::{ClassicFlavor, ClassicOptions, SnapFlavor, SnapOptions};
use image_builder::{gadget, CommonOptions, Error, Flavor, Machine};

#[derive(Parser)]
#[command(author, version, about = "Build snap-based and classic device images")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// Keep build state here; required to resume or stop early.
    #[arg(long, short = 'w', value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Write images and manifests here (default: current directory).
    #[arg(long, short = 'O', value_name = "DIR")]
    output_dir: Option<PathBuf>,

    /// Stop before running STEP.
    #[arg(long, short = 'u', value_name = "STEP", conflicts_with = "thru")]
    until: Option<String>,

    /// Stop after running STEP.
    #[arg(long, short = 't', value_name = "STEP")]
    thru: Option<String>,

    /// Continue an interrupted build from its workdir.
    #[arg(long, short = 'r')]
    resume: bool,

    /// Log at debug level.
    #[arg(long, short = 'd')]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build an Ubuntu Core image from a model assertion.
    Snap {
        /// Model assertion file.
        model: PathBuf,

        /// Channel to fetch snaps from.
        #[arg(long, short = 'c')]
        channel: Option<String>,

        /// Extra snap to seed, as NAME or NAME=CHANNEL. Repeatable.
        #[arg(long = "snap", value_name = "SNAP")]
        snaps: Vec<String>,

        /// File installed as .disk/info in the image.
        #[arg(long, value_name = "FILE")]
        disk_info: Option<PathBuf>,

        /// Minimum image size, e.g. 4G.
        #[arg(long, value_name = "SIZE", value_parser = parse_image_size)]
        image_size: Option<u64>,
    },
    /// Build a classic image from an image definition.
    Classic {
        /// Image definition (TOML).
        image_definition: PathBuf,
    },
}

fn parse_image_size(raw: &str) -> Result<u64, String> {
    gadget::parse_size(raw).map_err(|e| e.to_string())
}

fn init_logging(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default));
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).init();
}

fn build(cli: Cli) -> image_builder::Result<()> {
    let common = CommonOptions {
        workdir: cli.common.workdir,
        output_dir: cli.common.output_dir,
        until: cli.common.until,
        thru: cli.common.thru,
        resume: cli.common.resume,
    };

    let flavor: Box<dyn Flavor> = match cli.command {
        Command::Snap {
            model,
            channel,
            snaps,
            disk_info,
            image_size,
        } => Box::new(SnapFlavor::new(SnapOptions {
            model,
            channel,
            snaps,
            disk_info,
            image_size,
        })),
        Command::Classic { image_definition } => {
            Box::new(ClassicFlavor::new(ClassicOptions { image_definition }))
        }
    };

    let mut machine = Machine::new(common, flavor)?;
    machine.setup()?;
    machine.run()
}

fn report(err: &Error) {
    match err.step() {
        Some(step) => eprintln!("error ({} phase, step '{}'): {}", err.phase(), step, err),
        None => eprintln!("error ({} phase): {}", err.phase(), err),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.common.debug);

    match build(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            report(&err);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_until_and_thru_conflict() {
        let parsed = Cli::try_parse_from([
            "image-builder",
            "--until",
            "make_disk",
            "--thru",
            "make_disk",
            "classic",
            "image.toml",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_snap_arguments() {
        let cli = Cli::try_parse_from([
            "image-builder",
            "--workdir",
            "/tmp/work",
            "--resume",
            "snap",
            "pc.model",
            "--snap",
            "hello",
            "--snap",
            "htop=edge",
            "--image-size",
            "4G",
        ])
        .unwrap();
        assert!(cli.common.resume);
        match cli.command {
            Command::Snap {
                model,
                snaps,
                image_size,
                ..
            } => {
                assert_eq!(model, PathBuf::from("pc.model"));
                assert_eq!(snaps, ["hello", "htop=edge"]);
                assert_eq!(image_size, Some(4 * 1024 * 1024 * 1024));
            }
            Command::Classic { .. } => panic!("expected snap"),
        }
    }
}

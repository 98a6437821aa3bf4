// Copyright 2024 contributors to BeholdFS.

//! The `beholdfs` mount binary (spec §6).

use clap::Parser;

use beholdfs::cli::{build_config, Cli};

const EXIT_USAGE: i32 = 1;
const EXIT_FSROOT: i32 = 2;
const EXIT_MOUNT_FAILED: i32 = 3;

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            use clap::error::ErrorKind;
            match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => std::process::exit(0),
                _ => std::process::exit(EXIT_USAGE),
            }
        }
    };

    let config = match build_config(&cli.options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("beholdfs: {e}");
            std::process::exit(EXIT_USAGE);
        }
    };

    beholdfs::logging::init(config.log_level);

    if !cli.fsroot.is_dir() {
        eprintln!("beholdfs: {:?} is not a directory", cli.fsroot);
        std::process::exit(EXIT_FSROOT);
    }

    match run(&cli, config) {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            eprintln!("beholdfs: {e}");
            std::process::exit(EXIT_MOUNT_FAILED);
        }
    }
}

#[cfg(unix)]
fn run(cli: &Cli, config: beholdfs::config::Config) -> std::io::Result<()> {
    use beholdfs::posix::BeholdFs;
    use fuser::MountOption;

    let fs = BeholdFs::new(cli.fsroot.clone(), config);
    let options = vec![
        MountOption::FSName("beholdfs".to_string()),
        MountOption::DefaultPermissions,
    ];
    fuser::mount2(fs, &cli.mountpoint, &options)
}

#[cfg(not(unix))]
fn run(_cli: &Cli, _config: beholdfs::config::Config) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "beholdfs only mounts on unix-like platforms",
    ))
}

// build.rs

use clap::{Arg, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: update channel
fn channel_arg() -> Arg {
    Arg::new("channel")
        .long("channel")
        .default_value("stable")
        .help("Update channel")
}

fn build_cli() -> Command {
    Command::new("nepos-updater")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Nepos GmbH")
        .about("A/B system-image updater for Nepos appliances")
        .subcommand_required(true)
        .subcommand(
            Command::new("check")
                .about("Check whether a newer build is published")
                .arg(channel_arg())
                .arg(Arg::new("os_version").long("os-version").required(true).help("Build id of the running OS"))
                .arg(Arg::new("server").long("server").help("Update server base URL")),
        )
        .subcommand(
            Command::new("install")
                .about("Check and install a newer build into the inactive slot")
                .arg(channel_arg())
                .arg(Arg::new("os_version").long("os-version").required(true).help("Build id of the running OS"))
                .arg(Arg::new("commit_command").long("commit-command").help("Shell command that flips the next-boot selector")),
        )
        .subcommand(
            Command::new("show-image")
                .about("Print framing information and the digest of an image")
                .arg(Arg::new("kind").long("kind").required(true).help("Image kind (squashfs or android-boot)"))
                .arg(Arg::new("path").required(true).help("Image file or block device")),
        )
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let manifest_dir = match env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(e) => {
            println!("cargo:warning=CARGO_MANIFEST_DIR not set: {}", e);
            return;
        }
    };
    let man_dir = manifest_dir.join("man");

    if let Err(e) = fs::create_dir_all(&man_dir) {
        println!("cargo:warning=Failed to create man directory: {}", e);
        return;
    }

    let cmd = build_cli();
    let man = Man::new(cmd);
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("nepos-updater.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

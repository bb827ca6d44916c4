// build.rs

use clap::{Arg, ArgAction, Command};
use clap_mangen::Man;
use std::env;
use std::fs;
use std::path::PathBuf;

/// Common argument: configuration file
fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("PATH")
        .default_value("/etc/appman/installer.toml")
        .help("Installer configuration file")
}

fn build_cli() -> Command {
    Command::new("appman-installer")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Install and remove application packages")
        .arg(config_arg())
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("More output (-v info, -vv debug)"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("install")
                .about("Install a package from a file or an http(s) URL")
                .arg(Arg::new("source").required(true).help("Package file path or URL"))
                .arg(
                    Arg::new("location")
                        .short('l')
                        .long("location")
                        .help("Installation location id"),
                )
                .arg(
                    Arg::new("yes")
                        .short('y')
                        .long("yes")
                        .action(ArgAction::SetTrue)
                        .help("Do not ask for confirmation"),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("Remove an installed application")
                .arg(Arg::new("id").required(true).help("Application id"))
                .arg(
                    Arg::new("keep_documents")
                        .long("keep-documents")
                        .action(ArgAction::SetTrue)
                        .help("Keep the application's document directory"),
                )
                .arg(
                    Arg::new("force")
                        .short('f')
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Remove even if the removable medium is missing"),
                ),
        )
        .subcommand(
            Command::new("cleanup")
                .about("Repair the installation state after an interrupted operation"),
        )
        .subcommand(Command::new("locations").about("List the configured installation locations"))
        .subcommand(
            Command::new("keygen")
                .about("Generate a signing key pair")
                .arg(Arg::new("private").required(true).help("Private key output file"))
                .arg(Arg::new("public").required(true).help("Public key output file"))
                .arg(Arg::new("key_id").long("key-id").help("Key identifier")),
        )
        .subcommand(
            Command::new("create-package")
                .about("Create a package from an application directory")
                .arg(Arg::new("dir").required(true).help("Application directory"))
                .arg(Arg::new("output").required(true).help("Package output file"))
                .arg(Arg::new("id").long("id").help("Package id"))
                .arg(
                    Arg::new("developer_key")
                        .long("developer-key")
                        .help("Sign as developer with this private key file"),
                )
                .arg(
                    Arg::new("store_key")
                        .long("store-key")
                        .help("Sign as store with this private key file"),
                )
                .arg(
                    Arg::new("hardware_id")
                        .long("hardware-id")
                        .help("Bind the store signature to this device"),
                )
                .arg(
                    Arg::new("extra")
                        .long("extra")
                        .action(ArgAction::Append)
                        .help("Unsigned extra metadata, KEY=VALUE"),
                )
                .arg(
                    Arg::new("extra_signed")
                        .long("extra-signed")
                        .action(ArgAction::Append)
                        .help("Signed extra metadata, KEY=VALUE"),
                ),
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

    let man = Man::new(build_cli());
    let mut buffer = Vec::new();

    if let Err(e) = man.render(&mut buffer) {
        println!("cargo:warning=Failed to render man page: {}", e);
        return;
    }

    let man_path = man_dir.join("appman-installer.1");
    if let Err(e) = fs::write(&man_path, buffer) {
        println!("cargo:warning=Failed to write man page: {}", e);
    }
}

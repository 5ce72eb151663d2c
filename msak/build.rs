#![allow(missing_docs)]

use cfg_aliases::cfg_aliases;

fn main() {
    process_version_string();
    cfg_aliases! {
        linux: { target_os = "linux" },
    }
}

fn process_version_string() {
    // trap: release tarball builds don't get a git short hash
    let hash = git_short_hash().unwrap_or("unknown".into());
    println!("cargo:rustc-env=MSAK_BUILD_GIT_HASH={hash}");
    let cargo_version = env!("CARGO_PKG_VERSION");
    println!("cargo:rustc-env=MSAK_VERSION_STRING={cargo_version}+g{hash}");
}

fn git_short_hash() -> Option<String> {
    use std::process::Command;
    let args = &["rev-parse", "--short=8", "HEAD"];
    if let Ok(output) = Command::new("git").args(args).output() {
        let rev = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if rev.is_empty() { None } else { Some(rev) }
    } else {
        None
    }
}

//! Build-time version information
// (c) 2025 Ross Younger

/// Short version string
pub(crate) fn short() -> String {
    // this _should_ be provided by our build script; if not, something went wrong
    if let Some(v) = option_env!("MSAK_VERSION_STRING") {
        return v.to_string();
    }
    let hash = option_env!("MSAK_BUILD_GIT_HASH").unwrap_or("???");
    format!("{}+g{hash}", env!("CARGO_PKG_VERSION"))
}

/// Git commit fingerprint (short form) of the running server code
pub(crate) fn git_commit() -> &'static str {
    option_env!("MSAK_BUILD_GIT_HASH").unwrap_or("unknown")
}

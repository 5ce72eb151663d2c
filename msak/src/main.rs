//! msak server - main entrypoint
// (c) 2025 Ross Younger

use std::process::ExitCode;

use mimalloc::MiMalloc;
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    match msak::cli() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if msak::util::tracing_is_initialised() {
                tracing::error!("{e:#}");
            } else {
                eprintln!("Error: {e:#}");
            }
            ExitCode::FAILURE
        }
    }
}

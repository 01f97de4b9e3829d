use std::env;
use std::path::PathBuf;
use std::process::{Command, ExitCode};

const RELAY: &str = "coverage-relay";

// Short alias for container step definitions. Prefers the relay installed
// next to this binary over whatever is first on PATH.
fn relay_binary() -> PathBuf {
    env::current_exe()
        .ok()
        .and_then(|exe| {
            exe.parent()
                .map(|dir| dir.join(format!("{RELAY}{}", env::consts::EXE_SUFFIX)))
        })
        .filter(|candidate| candidate.is_file())
        .unwrap_or_else(|| PathBuf::from(RELAY))
}

fn main() -> ExitCode {
    let relay = relay_binary();
    match Command::new(&relay).args(env::args_os().skip(1)).status() {
        Ok(status) if status.success() => ExitCode::SUCCESS,
        Ok(status) => status
            .code()
            .and_then(|code| u8::try_from(code).ok())
            .map_or(ExitCode::FAILURE, ExitCode::from),
        Err(err) => {
            eprintln!("failed to invoke {}: {err}", relay.display());
            ExitCode::FAILURE
        }
    }
}

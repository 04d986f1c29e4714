//! The program named by `SSH_ASKPASS`: connects to the socket named by
//! `PSSH_ASKPASS_SOCKET`, prints the password to stdout, and exits (§4.4,
//! §6 child process contract).

use std::path::PathBuf;
use std::process::ExitCode;

fn main() -> ExitCode {
    let Some(socket_path) = std::env::var_os("PSSH_ASKPASS_SOCKET") else {
        eprintln!("pssh-askpass-helper: PSSH_ASKPASS_SOCKET is not set");
        return ExitCode::FAILURE;
    };
    match pssh_askpass::fetch_password(&PathBuf::from(socket_path)) {
        Ok(password) => {
            println!("{password}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("pssh-askpass-helper: {e}");
            ExitCode::FAILURE
        }
    }
}

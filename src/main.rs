use std::process::ExitCode;

fn main() -> ExitCode {
    netpulse_lib::run()
}

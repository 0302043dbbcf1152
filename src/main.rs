//! Command-line runner for SQL compliance controls.

mod cli;

fn main() {
    let code = cli::run(std::env::args().skip(1).collect());
    std::process::exit(code);
}

use std::process::exit;

fn main() {
    if let Err(message) = delver::app::run_cli() {
        eprintln!("delver: {message}");
        exit(1);
    }
}

use basecorr::{run, Config};
use std::process;

fn main() {
    let config = match Config::new() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&config) {
        eprintln!("{}", e);
        process::exit(1);
    }
}

/// Stepwise command-line front end
///
/// Compiles, runs and debugs scripts from the terminal. See `stepwise --help`.

use stepwise_core::cli;

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run_cli().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

use clap::Parser;
use citrine::cli::Cli;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = citrine::run(cli.cmd).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

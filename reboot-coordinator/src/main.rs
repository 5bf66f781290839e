use clap::Parser;
use owo_colors::OwoColorize;
use reboot_coordinator::supervisor::{self, Config};

#[tokio::main]
async fn main() {
    reboot_coordinator_common::init();
    let config = Config::parse();

    if let Err(e) = supervisor::run(config).await {
        eprintln!("{}", format!("fatal: {e}").red());
        std::process::exit(1);
    }
}

use clap::Parser;

use cwsf::cli::{self, Cli};
use cwsf::lifecycle;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    lifecycle::init_logging(cli.verbose, cli.quiet);

    let code = cli::execute(cli).await;
    std::process::exit(code);
}

use clap::Parser;

fn main() {
    clipkeepctl::init_tracing();
    let cli = clipkeepctl::Cli::parse();
    if let Err(err) = clipkeepctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

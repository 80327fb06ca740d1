use clap::Parser;

fn main() {
    let cli = adsyncctl::Cli::parse();
    if let Err(err) = adsyncctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

use clap::Parser;

fn main() {
    let args = ehlink::cli::Args::parse();
    if let Err(err) = ehlink::run(args) {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

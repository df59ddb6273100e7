use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "ehlink", version)]
pub struct Args {
    #[arg(short = 'o', long = "output")]
    pub output: Option<String>,

    #[arg(short = 'l', long = "list")]
    pub list: bool,

    #[arg(long = "verbose", short = 'v')]
    pub verbose: bool,

    #[arg(value_name = "INPUT")]
    pub inputs: Vec<String>,
}

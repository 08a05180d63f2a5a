use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "talkwire-server", about = "Talkwire push-to-talk router")]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/talkwire.toml")]
    pub config: String,
}

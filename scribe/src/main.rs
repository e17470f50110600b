mod cli;
mod config;

pub fn main() -> anyhow::Result<()> {
    let args = argh::from_env::<cli::Args>();
    args.run()
}

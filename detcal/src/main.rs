mod cli;
mod display;

use clap::Parser;
use log::LevelFilter;
use std::io::Write;

use cli::Detcal;

fn main() -> anyhow::Result<()> {
    let args = Detcal::parse();

    let level = match args.global_opts.verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::builder()
        .format(|buf, record| {
            writeln!(
                buf,
                "{:<5} - mod path |{}| - target | {} | args: |{}|",
                record.level(),
                record.module_path().unwrap_or(""),
                record.target(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Warn)
        .filter_module("detcal_engine", level)
        .filter_module("detcal", level)
        .init();

    args.run()
}

use colored::Colorize;

fn run() -> anyhow::Result<()> {
    stagehand::run()?;
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("{} {:#}", "error:".bright_red().bold(), e);
        std::process::exit(1);
    }
}

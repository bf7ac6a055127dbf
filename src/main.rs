use std::path::PathBuf;

use clap::Parser;

/// Manually map a 64-bit PE image into the current process.
#[derive(Debug, Parser)]
#[command(name = "pemap", version, about, long_about = None)]
struct Cli {
    /// Path to the PE file to map.
    #[arg(value_name = "FILE")]
    path: PathBuf,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("pemap", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    run(&cli)
}

#[cfg(all(target_arch = "x86_64", target_os = "windows"))]
fn run(cli: &Cli) -> anyhow::Result<()> {
    use anyhow::Context;

    let pe = pemap::PeImage::from_file(&cli.path)
        .with_context(|| format!("failed to parse {}", cli.path.display()))?;

    let module = unsafe { pemap::load(&pe) }
        .with_context(|| format!("failed to map {}", cli.path.display()))?;

    println!(
        "mapped {} at {:p} ({:#x} bytes, {} sections, {} dependencies)",
        cli.path.display(),
        module.base(),
        module.image_size(),
        module.section_headers().len(),
        module.imported_libraries().len(),
    );
    if let Some(entry) = module.entry_point() {
        println!("entry point at {entry:p}");
    }

    Ok(())
}

#[cfg(not(all(target_arch = "x86_64", target_os = "windows")))]
fn run(_cli: &Cli) -> anyhow::Result<()> {
    anyhow::bail!("manual mapping is only supported on x86_64 Windows");
}

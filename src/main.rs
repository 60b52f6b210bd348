mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::Cli;
use trace2svg::{ProgressEvent, convert_streaming, init_pool, load_image, write_svg};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let params = cli.parameters()?;
    let output_path = cli.output_path();

    if let Some(threads) = cli.threads.filter(|&n| n > 0) {
        if let Err(e) = init_pool(threads) {
            log::warn!("Falling back to sequential processing: {}", e);
        }
    }

    println!(
        "Converting {} to {} ({} backend)...",
        cli.input.display(),
        output_path.display(),
        params.backend()
    );

    let image = load_image(&cli.input)?;
    let show_progress = cli.progress;
    let report = move |event: ProgressEvent| {
        if show_progress {
            eprintln!("[{:>3}%] {:?}: {}", event.percent, event.stage, event.message);
        }
    };
    let result = convert_streaming(&image, &params, &report)?;

    write_svg(&result, params.svg_precision, &output_path)
        .with_context(|| format!("writing {}", output_path.display()))?;

    println!(
        "Conversion complete! {} primitives in {:.2?}",
        result.metadata.primitive_count, result.metadata.elapsed
    );
    Ok(())
}

//! Bulk download command implementation.

use {
    crate::{Cli, block_on, config::Config, open_link, use_fancy_output, was_interrupted},
    anyhow::{Context, Result},
    chrono::Local,
    console::style,
    indicatif::{ProgressBar, ProgressStyle},
    meterlink::{DownloadOptions, DownloadProgress, MeasurementDownloader, export_record},
    std::{
        path::{Path, PathBuf},
        time::Duration,
    },
};

/// Resolve download options: CLI flags, then config, then library defaults.
fn download_options(
    config: &Config,
    throttle_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> DownloadOptions {
    let defaults = DownloadOptions::default();
    DownloadOptions {
        request_timeout: timeout_ms
            .map(Duration::from_millis)
            .or_else(|| config.request_timeout())
            .unwrap_or(defaults.request_timeout),
        throttle: throttle_ms
            .map(Duration::from_millis)
            .or_else(|| config.throttle())
            .unwrap_or(defaults.throttle),
    }
}

fn output_dir(config: &Config, out: Option<&PathBuf>) -> PathBuf {
    out.cloned()
        .or_else(|| config.download.output_dir.clone())
        .unwrap_or_else(|| PathBuf::from("."))
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(0);
    #[allow(clippy::unwrap_used)] // Static template string
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Download command implementation.
pub(crate) fn cmd_download(
    cli: &Cli,
    config: &mut Config,
    out: Option<&PathBuf>,
    throttle_ms: Option<u64>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let options = download_options(config, throttle_ms, timeout_ms);
    let dir = output_dir(config, out);
    let link = open_link(cli, config)?;
    let pb = progress_bar(cli.quiet);
    let started = Local::now();

    let bar = pb.clone();
    let target = dir.clone();
    let (result, written) = block_on(async move {
        let mut written: Vec<PathBuf> = Vec::new();
        let result = async {
            let identity = link.connect().await?;
            bar.set_message(format!("from {}", identity.model));
            let report = MeasurementDownloader::new(&link)
                .with_options(options)
                .run(
                    &mut |DownloadProgress { current, total }| {
                        bar.set_length(u64::from(total));
                        bar.set_position(u64::from(current));
                    },
                    &mut |record| {
                        written.push(export_record(&target, record, &started)?);
                        Ok(())
                    },
                )
                .await?;
            link.disconnect()?;
            Ok::<_, meterlink::Error>(report)
        }
        .await;
        (result, written)
    })?;

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            pb.abandon();
            if !written.is_empty() {
                eprintln!(
                    "{} {} measurement files were written to {} before the download stopped",
                    style("ℹ").blue(),
                    written.len(),
                    dir.display()
                );
            }
            let context = if was_interrupted() {
                "Download interrupted"
            } else {
                "Download failed"
            };
            return Err(anyhow::Error::from(err).context(context));
        },
    };

    pb.finish_and_clear();

    for path in &written {
        println!("{}", path.display());
    }

    if !cli.quiet {
        if report.records.is_empty() {
            eprintln!("{} No stored measurements", style("ℹ").blue());
        } else {
            let icon = if use_fancy_output() { "🎉" } else { "✓" };
            eprintln!(
                "{} Downloaded {} measurements ({} bytes) to {}",
                style(icon).green(),
                report.records.len(),
                report.total_bytes(),
                display_dir(&dir)
            );
        }
    }

    Ok(())
}

fn display_dir(dir: &Path) -> String {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_options_defaults() {
        let options = download_options(&Config::default(), None, None);
        assert_eq!(options, DownloadOptions::default());
    }

    #[test]
    fn test_download_options_cli_over_config() {
        let mut config = Config::default();
        config.download.throttle_ms = Some(200);
        config.download.request_timeout_ms = Some(3000);

        let options = download_options(&config, Some(0), None);
        assert_eq!(options.throttle, Duration::ZERO);
        assert_eq!(options.request_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_output_dir_resolution() {
        let mut config = Config::default();
        assert_eq!(output_dir(&config, None), PathBuf::from("."));

        config.download.output_dir = Some(PathBuf::from("results"));
        assert_eq!(output_dir(&config, None), PathBuf::from("results"));

        let explicit = PathBuf::from("elsewhere");
        assert_eq!(output_dir(&config, Some(&explicit)), explicit);
    }

    #[test]
    fn test_hidden_progress_bar_when_quiet() {
        assert!(progress_bar(true).is_hidden());
    }
}

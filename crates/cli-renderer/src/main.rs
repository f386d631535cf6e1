use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use renderer::{BatchCoordinator, JobRunner, JobStatus, RenderConfig, WorkspaceRegistry};

/// Render Slippi replays to mp4 videos
#[derive(Parser, Debug)]
#[command(name = "slp2mp4", author, version, about, long_about = None)]
struct Args {
    /// Replay file, or a directory searched recursively for replays
    input: PathBuf,

    /// Output file ending in .mp4, or output directory (created if missing)
    output: Option<PathBuf>,

    /// Path to configuration file (JSON or TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins; otherwise info, or debug with -v
    let default_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let cfg = RenderConfig::load_config(args.config.as_deref())
        .context("Failed to load configuration")?;
    cfg.validate().context("Invalid configuration")?;

    info!("slp2mp4 starting");
    info!("  Emulator: {}", cfg.dolphin_bin().display());
    info!("  ISO: {}", cfg.melee_iso.display());
    info!("  Resolution: {} (widescreen: {})", cfg.resolution, cfg.widescreen);
    info!("  Working dir: {}", cfg.working_dir.display());

    let registry = WorkspaceRegistry::new();

    tokio::select! {
        result = run(&args, &cfg, registry.clone()) => result,
        Ok(()) = tokio::signal::ctrl_c() => {
            warn!("Interrupted, removing in-flight workspaces");
            let removed = registry.release_all();
            bail!("interrupted; removed {} in-flight workspace(s)", removed)
        }
    }
}

async fn run(args: &Args, cfg: &RenderConfig, registry: WorkspaceRegistry) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to read current directory")?;
    let input = cwd.join(&args.input);
    let runner = JobRunner::new(cfg, registry);

    if input.is_dir() {
        let out_root = args.output.as_deref().map(|p| cwd.join(p)).unwrap_or(cwd);
        let workers = cfg.parallel_games.worker_count();

        let summary = BatchCoordinator::new(runner, workers, cfg.combine)
            .run(&input, &out_root)
            .await
            .with_context(|| format!("Batch render of {} failed", input.display()))?;

        if summary.failed > 0 {
            bail!("{} replay(s) failed to render", summary.failed);
        }
        return Ok(());
    }

    if !input.is_file() {
        bail!("Replay not found: {}", input.display());
    }

    let output = resolve_output_path(&input, args.output.as_deref(), &cwd)?;
    let mut job = runner
        .prepare(&input, &output)
        .with_context(|| format!("Failed to read replay: {}", input.display()))?;

    let status = runner
        .execute(&mut job)
        .await
        .with_context(|| format!("Failed to render {}", input.display()))?;

    match status {
        JobStatus::Skipped => info!(
            "Skipped {}: {}",
            input.display(),
            job.reason.as_deref().unwrap_or("no reason given")
        ),
        _ => info!("Wrote {}", output.display()),
    }
    Ok(())
}

/// Where a single replay's video goes:
/// `OUT` ending in `.mp4` is the file itself, any other `OUT` is a directory
/// receiving `<replay stem>.mp4`, and no `OUT` means the current directory.
fn resolve_output_path(input: &Path, output: Option<&Path>, cwd: &Path) -> Result<PathBuf> {
    let stem = input
        .file_stem()
        .with_context(|| format!("Replay path has no file name: {}", input.display()))?;
    let file_name = format!("{}.mp4", stem.to_string_lossy());

    Ok(match output {
        Some(out) if out.to_string_lossy().ends_with(".mp4") => cwd.join(out),
        Some(dir) => cwd.join(dir).join(file_name),
        None => cwd.join(file_name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_defaults_to_stem_in_cwd() {
        let out = resolve_output_path(Path::new("/replays/Game_1.slp"), None, Path::new("/home/me")).unwrap();
        assert_eq!(out, PathBuf::from("/home/me/Game_1.mp4"));
    }

    #[test]
    fn test_output_with_mp4_suffix_is_the_file() {
        let out = resolve_output_path(
            Path::new("/replays/Game_1.slp"),
            Some(Path::new("my_video.mp4")),
            Path::new("/home/me"),
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/home/me/my_video.mp4"));

        let out = resolve_output_path(
            Path::new("/replays/Game_1.slp"),
            Some(Path::new("/abs/clip.mp4")),
            Path::new("/home/me"),
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/abs/clip.mp4"));
    }

    #[test]
    fn test_output_directory_receives_stem() {
        let out = resolve_output_path(
            Path::new("/replays/Game_1.slp"),
            Some(Path::new("videos")),
            Path::new("/home/me"),
        )
        .unwrap();
        assert_eq!(out, PathBuf::from("/home/me/videos/Game_1.mp4"));
    }

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from(["slp2mp4", "game.slp", "out", "-c", "cfg.toml", "-v"]).unwrap();
        assert_eq!(args.input, PathBuf::from("game.slp"));
        assert_eq!(args.output, Some(PathBuf::from("out")));
        assert_eq!(args.config, Some(PathBuf::from("cfg.toml")));
        assert!(args.verbose);

        assert!(Args::try_parse_from(["slp2mp4"]).is_err());
    }
}

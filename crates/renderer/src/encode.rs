use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use crate::error::EncodeError;

/// Captured result of a successful encoder run
#[derive(Debug, Clone)]
pub struct EncodeOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs the external encoder: muxing dumps into an mp4 and concatenating mp4s
#[derive(Debug, Clone)]
pub struct EncodeInvoker {
    ffmpeg_bin: PathBuf,
}

impl EncodeInvoker {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
        }
    }

    pub fn ffmpeg_bin(&self) -> &Path {
        &self.ffmpeg_bin
    }

    /// Mux the dumped video and audio into `output` without re-encoding the video
    pub async fn run(&self, video: &Path, audio: &Path, output: &Path) -> Result<EncodeOutput, EncodeError> {
        let result = self.execute(mux_args(video, audio, output)).await?;
        ensure_output(output)?;
        info!("Encoded {}", output.display());
        Ok(result)
    }

    /// Stream-copy the files listed in `manifest` into `output`
    pub async fn combine(&self, manifest: &Path, output: &Path) -> Result<EncodeOutput, EncodeError> {
        let result = self.execute(concat_args(manifest, output)).await?;
        ensure_output(output)?;
        info!("Combined videos into {}", output.display());
        Ok(result)
    }

    async fn execute(&self, args: Vec<String>) -> Result<EncodeOutput, EncodeError> {
        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        debug!("Executing encoder: {}", cmd_str);

        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| EncodeError::Spawn {
            bin: self.ffmpeg_bin.clone(),
            source,
        })?;

        // Drain both pipes while waiting; ffmpeg is chatty enough to fill one
        let stdout_handle = child.stdout.take().map(|s| tokio::spawn(read_lines(s)));
        let stderr_handle = child.stderr.take().map(|s| tokio::spawn(read_lines(s)));

        let status = child.wait().await.map_err(|source| EncodeError::Spawn {
            bin: self.ffmpeg_bin.clone(),
            source,
        })?;

        let stdout = collect(stdout_handle).await;
        let stderr = collect(stderr_handle).await;

        // Killed by a signal has no code
        let exit_code = status.code().unwrap_or(-1);
        if !status.success() {
            return Err(EncodeError::Failed {
                exit_code,
                command: cmd_str,
                stderr,
            });
        }

        Ok(EncodeOutput {
            exit_code,
            stdout,
            stderr,
        })
    }
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> String {
    let mut lines = Vec::new();
    let mut line_stream = BufReader::new(reader).lines();
    while let Ok(Some(line)) = line_stream.next_line().await {
        lines.push(line);
    }
    lines.join("\n")
}

async fn collect(handle: Option<tokio::task::JoinHandle<String>>) -> String {
    match handle {
        Some(h) => h.await.unwrap_or_default(),
        None => String::new(),
    }
}

fn ensure_output(output: &Path) -> Result<(), EncodeError> {
    if output.is_file() {
        Ok(())
    } else {
        Err(EncodeError::MissingOutput(output.to_path_buf()))
    }
}

/// `-y -i <audio> -i <video> -map 1:v -map 0:a -c:a mp3 -c:v copy <output>`
pub fn mux_args(video: &Path, audio: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        audio.to_string_lossy().to_string(),
        "-i".to_string(),
        video.to_string_lossy().to_string(),
        "-map".to_string(),
        "1:v".to_string(),
        "-map".to_string(),
        "0:a".to_string(),
        "-c:a".to_string(),
        "mp3".to_string(),
        "-c:v".to_string(),
        "copy".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// `-safe 0 -f concat -i <manifest> -c copy <output>`
pub fn concat_args(manifest: &Path, output: &Path) -> Vec<String> {
    vec![
        "-safe".to_string(),
        "0".to_string(),
        "-f".to_string(),
        "concat".to_string(),
        "-i".to_string(),
        manifest.to_string_lossy().to_string(),
        "-c".to_string(),
        "copy".to_string(),
        output.to_string_lossy().to_string(),
    ]
}

/// Write a concat demuxer manifest listing `inputs` in order
pub fn write_concat_manifest(manifest: &Path, inputs: &[PathBuf]) -> Result<(), EncodeError> {
    let mut body = String::new();
    for input in inputs {
        // Single quotes close, escape, and reopen inside a quoted path
        let quoted = input.to_string_lossy().replace('\'', "'\\''");
        let _ = writeln!(body, "file '{}'", quoted);
    }
    fs::write(manifest, body).map_err(|source| EncodeError::Manifest {
        path: manifest.to_path_buf(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn test_mux_args_copy_video_and_map_streams() {
        let args = mux_args(
            Path::new("/ws/Dump/Frames/framedump0.avi"),
            Path::new("/ws/Dump/Audio/dspdump.wav"),
            Path::new("/out/game.mp4"),
        );
        assert_eq!(
            args.join(" "),
            "-y -i /ws/Dump/Audio/dspdump.wav -i /ws/Dump/Frames/framedump0.avi \
             -map 1:v -map 0:a -c:a mp3 -c:v copy /out/game.mp4"
        );
    }

    #[test]
    fn test_concat_args() {
        let args = concat_args(Path::new("/tmp/list.txt"), Path::new("/out/set.mp4"));
        assert_eq!(args.join(" "), "-safe 0 -f concat -i /tmp/list.txt -c copy /out/set.mp4");
    }

    #[test]
    fn test_manifest_quotes_paths() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("list.txt");
        write_concat_manifest(
            &manifest,
            &[PathBuf::from("/out/a.mp4"), PathBuf::from("/out/Fox's game.mp4")],
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(&manifest).unwrap(),
            "file '/out/a.mp4'\nfile '/out/Fox'\\''s game.mp4'\n"
        );
    }

    #[tokio::test]
    async fn test_missing_encoder_binary_is_spawn_error() {
        let invoker = EncodeInvoker::new("/nonexistent/ffmpeg");
        let err = invoker
            .run(Path::new("v.avi"), Path::new("a.wav"), Path::new("o.mp4"))
            .await
            .unwrap_err();
        assert!(matches!(err, EncodeError::Spawn { .. }), "{}", err);
    }

    #[cfg(unix)]
    pub(crate) mod fake {
        use std::fs;
        use std::os::unix::fs::PermissionsExt;
        use std::path::{Path, PathBuf};

        fn script(path: &Path, body: &str) -> PathBuf {
            fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
            path.to_path_buf()
        }

        /// Writes the last argument's file, records its arguments, succeeds
        pub fn working_ffmpeg(path: &Path) -> PathBuf {
            script(
                path,
                r#"for last; do :; done
echo "$@" >> "$0.calls"
echo encoded > "$last"
echo "frame=  120 fps=0.0" >&2"#,
            )
        }

        pub fn failing_ffmpeg(path: &Path) -> PathBuf {
            script(path, "echo 'Invalid data found when processing input' >&2\nexit 1")
        }

        /// Exits 0 without producing anything
        pub fn silent_ffmpeg(path: &Path) -> PathBuf {
            script(path, "exit 0")
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_succeeds_and_captures_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = EncodeInvoker::new(fake::working_ffmpeg(&dir.path().join("ffmpeg")));
        let output = dir.path().join("game.mp4");

        let result = invoker
            .run(&dir.path().join("v.avi"), &dir.path().join("a.wav"), &output)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stderr.contains("frame="));
        assert!(output.is_file());

        let calls = fs::read_to_string(dir.path().join("ffmpeg.calls")).unwrap();
        // Audio is input 0 and video input 1, whatever order the caller names them in
        let expected_inputs = format!(
            "-y -i {} -i {} -map 1:v -map 0:a -c:a mp3 -c:v copy",
            dir.path().join("a.wav").display(),
            dir.path().join("v.avi").display()
        );
        assert!(calls.contains(&expected_inputs), "{}", calls);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_encode_error_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = EncodeInvoker::new(fake::failing_ffmpeg(&dir.path().join("ffmpeg")));

        let err = invoker
            .run(Path::new("v.avi"), Path::new("a.wav"), &dir.path().join("o.mp4"))
            .await
            .unwrap_err();
        match err {
            EncodeError::Failed { exit_code, stderr, command } => {
                assert_eq!(exit_code, 1);
                assert!(stderr.contains("Invalid data"));
                assert!(command.contains("-c:v copy"));
            }
            other => panic!("expected Failed, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_output_is_missing_output() {
        let dir = tempfile::tempdir().unwrap();
        let invoker = EncodeInvoker::new(fake::silent_ffmpeg(&dir.path().join("ffmpeg")));
        let output = dir.path().join("o.mp4");

        let err = invoker.combine(&dir.path().join("list.txt"), &output).await.unwrap_err();
        assert!(matches!(err, EncodeError::MissingOutput(ref p) if p == &output), "{}", err);
    }
}

use log::{info, warn};
use std::fs::File as StdFile;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Drain a child's output pipe into a log file, one tagged line at a
/// time. The sink task ends when the child closes its end.
pub fn to_file<F: IntoRawFd>(out: F, path: PathBuf, tag: String) {
    let src = File::from_std(unsafe { StdFile::from_raw_fd(out.into_raw_fd()) });

    tokio::spawn(async move {
        let mut dst = match OpenOptions::new().create(true).append(true).open(&path).await {
            Ok(dst) => dst,
            Err(err) => {
                warn!("failed to open log file {}: {}", path.display(), err);
                return;
            }
        };

        let mut lines = BufReader::new(src).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let entry = format!("{}: {}\n", tag, line);
            if dst.write_all(entry.as_bytes()).await.is_err() {
                break;
            }
        }
    });
}

/// Drain a child's output pipe into the supervisor's own logger under
/// the service's tag.
pub fn to_log<F: IntoRawFd>(out: F, tag: String) {
    let src = File::from_std(unsafe { StdFile::from_raw_fd(out.into_raw_fd()) });

    tokio::spawn(async move {
        let mut lines = BufReader::new(src).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "svc", "{}: {}", tag, line);
        }
    });
}

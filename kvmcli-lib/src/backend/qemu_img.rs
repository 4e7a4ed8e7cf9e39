// SPDX-License-Identifier: GPL-2.0-only
use crate::backend::traits::{OverlayBackend, OverlayError, OverlayInfo};
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// qcow2 overlays created with `qemu-img create -b`.
pub struct QemuImgBackend {
    binary: String,
    timeout: Duration,
}

impl QemuImgBackend {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        QemuImgBackend {
            binary: binary.into(),
            timeout,
        }
    }
}

/// Arguments for `qemu-img` to create `dest` on top of `base`.
fn overlay_args(base: &Path, dest: &Path, size: Option<&str>) -> Vec<String> {
    // qemu option values escape commas by doubling them
    let backing = base.to_string_lossy().replace(',', ",,");
    let mut args = vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-o".to_string(),
        format!("backing_file={backing},backing_fmt=qcow2"),
        dest.to_string_lossy().to_string(),
    ];
    if let Some(size) = size {
        args.push(size.to_string());
    }
    args
}

/// Wait for `child`, killing it once `timeout` has elapsed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<ExitStatus, OverlayError> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if started.elapsed() >= timeout => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(OverlayError::Timeout(timeout));
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = child.kill();
                return Err(OverlayError::Io(format!("cannot check image tool status: {e}")));
            }
        }
    }
}

fn remove_partial(dest: &Path) {
    if let Err(e) = std::fs::remove_file(dest) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %dest.display(), error = %e, "cannot remove partial overlay");
        }
    }
}

impl OverlayBackend for QemuImgBackend {
    fn create_overlay(
        &self,
        base: &Path,
        dest: &Path,
        size: Option<&str>,
    ) -> Result<OverlayInfo, OverlayError> {
        if !base.exists() {
            return Err(OverlayError::NotFound(format!(
                "base image does not exist: {}",
                base.display()
            )));
        }

        if dest.exists() {
            return Err(OverlayError::AlreadyExists(format!(
                "overlay already exists: {}",
                dest.display()
            )));
        }

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OverlayError::Io(format!("cannot create directory {}: {e}", parent.display()))
            })?;
        }

        let args = overlay_args(base, dest, size);
        tracing::debug!(binary = %self.binary, args = ?args, "creating overlay");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OverlayError::Command(format!("cannot run {}: {e}", self.binary)))?;

        // Drain stderr while waiting so a chatty tool cannot fill the pipe
        // and stall until the timeout.
        let mut pipe = child.stderr.take();
        let reader = std::thread::spawn(move || {
            let mut text = String::new();
            if let Some(pipe) = pipe.as_mut() {
                let _ = pipe.read_to_string(&mut text);
            }
            text
        });

        let status = match wait_with_timeout(&mut child, self.timeout) {
            Ok(status) => status,
            Err(e) => {
                remove_partial(dest);
                return Err(e);
            }
        };

        if !status.success() {
            remove_partial(dest);
            let stderr = reader.join().unwrap_or_default();
            return Err(OverlayError::Command(format!(
                "{} exited with {}: {}",
                self.binary,
                status,
                stderr.trim()
            )));
        }

        Ok(OverlayInfo {
            path: dest.to_path_buf(),
            base: base.to_path_buf(),
            size: size.map(str::to_string),
        })
    }

    fn delete_overlay(&self, path: &Path) -> Result<bool, OverlayError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(OverlayError::Io(format!(
                "cannot remove overlay {}: {e}",
                path.display()
            ))),
        }
    }
}

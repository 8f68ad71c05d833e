//! In-place agent self-update: download, swap the binary, re-exec.

use std::convert::Infallible;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::time::Duration;

use tracing::info;

use crate::error::{Error, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Download the new binary and replace the running process with it.
/// Only ever returns an error: on success the process image is replaced and
/// execution continues in the new binary with the same argv and environment.
pub async fn self_update(
    http: &reqwest::Client,
    download_url: &str,
    version: &str,
) -> Result<Infallible> {
    info!(version, download_url, "downloading agent binary");

    let response = http
        .get(download_url)
        .timeout(DOWNLOAD_TIMEOUT)
        .send()
        .await
        .map_err(|e| Error::Update(format!("download failed: {e}")))?;

    if !response.status().is_success() {
        return Err(Error::Update(format!(
            "download returned {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::Update(format!("download failed: {e}")))?;
    if bytes.is_empty() {
        return Err(Error::Update("download was empty".to_string()));
    }

    let exe = std::env::current_exe()?;
    install(&bytes, &exe).await?;

    info!(version, "binary swapped, re-executing");
    let args: Vec<_> = std::env::args_os().skip(1).collect();
    let exec_error = std::process::Command::new(&exe).args(args).exec();

    Err(Error::Update(format!("re-exec failed: {exec_error}")))
}

/// Write the new binary next to the current one, make it executable, then
/// atomically rename it over the running executable.
pub(crate) async fn install(bytes: &[u8], exe: &Path) -> Result<()> {
    let file_name = exe
        .file_name()
        .ok_or_else(|| Error::Update("executable has no file name".to_string()))?
        .to_string_lossy();
    let staged = exe.with_file_name(format!("{file_name}.new"));

    tokio::fs::write(&staged, bytes).await?;
    tokio::fs::set_permissions(&staged, std::fs::Permissions::from_mode(0o755)).await?;
    tokio::fs::rename(&staged, exe).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::install;

    #[tokio::test]
    async fn install_replaces_binary_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("paasdeploy-agent");
        tokio::fs::write(&exe, b"old binary").await.unwrap();

        install(b"new binary", &exe).await.unwrap();

        assert_eq!(tokio::fs::read(&exe).await.unwrap(), b"new binary");
        // staging file is gone after the rename
        assert!(!exe.with_file_name("paasdeploy-agent.new").exists());

        let mode = tokio::fs::metadata(&exe).await.unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

//! Per-cluster working directory preparation.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::diagnostics::clean_output;
use crate::process::ToolCommand;
use crate::{ProvisionerError, Result};

/// Copy `template` into `dest` recursively. Existing files are overwritten,
/// other files in `dest` are left alone.
pub async fn seed_from_template(template: &Path, dest: &Path) -> Result<u64> {
    if !tokio::fs::try_exists(template).await? {
        return Err(ProvisionerError::Workdir(format!(
            "template directory {} does not exist",
            template.display()
        )));
    }

    let mut copied = 0u64;
    let mut pending: Vec<(PathBuf, PathBuf)> = vec![(template.to_path_buf(), dest.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                tokio::fs::copy(entry.path(), &target).await?;
                copied += 1;
            }
        }
    }
    info!(template = %template.display(), dest = %dest.display(), files = copied, "Seeded working directory");
    Ok(copied)
}

/// Generate an RSA keypair at `private_key` (`.pub` alongside) unless one exists.
pub async fn ensure_keypair(
    ssh_keygen: &str,
    private_key: &Path,
    bits: u32,
    comment: &str,
    timeout: std::time::Duration,
) -> Result<()> {
    if tokio::fs::try_exists(private_key).await? {
        debug!(key = %private_key.display(), "Keypair already present");
        return Ok(());
    }
    if let Some(parent) = private_key.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let output = ToolCommand::new(ssh_keygen)
        .args(["-q", "-t", "rsa", "-N", ""])
        .arg("-b")
        .arg(bits.to_string())
        .arg("-C")
        .arg(comment)
        .arg("-f")
        .arg(private_key.to_string_lossy())
        .timeout(timeout)
        .output()
        .await?;

    if !output.success() {
        return Err(ProvisionerError::ToolFailed {
            command: "ssh-keygen".into(),
            message: clean_output(output.diagnostic()),
        });
    }
    info!(key = %private_key.display(), "Generated SSH keypair");
    Ok(())
}

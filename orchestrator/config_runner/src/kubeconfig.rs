//! Admin kubeconfig extraction from an ad-hoc `slurp` of the first master.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::Value;

use crate::{Result, RunnerError};

pub const ADMIN_CONF_SLURP_ARGS: &str = "src=/etc/kubernetes/admin.conf";

/// Decode the file content from ad-hoc output of the form
/// `host | SUCCESS => { ..., "content": "<base64>", ... }`.
pub fn decode_slurp(stdout: &str) -> Result<String> {
    let (_, body) = stdout
        .split_once("=>")
        .ok_or_else(|| RunnerError::Kubeconfig(format!("unexpected output: {}", stdout.trim())))?;
    let result: Value = serde_json::from_str(body.trim())?;
    let content = result
        .get("content")
        .and_then(Value::as_str)
        .ok_or_else(|| RunnerError::Kubeconfig("no content in slurp result".into()))?;
    let bytes = STANDARD
        .decode(content.trim())
        .map_err(|e| RunnerError::Kubeconfig(format!("invalid base64 content: {e}")))?;
    String::from_utf8(bytes).map_err(|e| RunnerError::Kubeconfig(format!("kubeconfig is not UTF-8: {e}")))
}

/// Point every `server:` entry at `address`, keeping scheme and port.
pub fn rewrite_server(kubeconfig: &str, address: &str) -> String {
    let mut out = String::with_capacity(kubeconfig.len());
    for line in kubeconfig.split_inclusive('\n') {
        let trimmed = line.trim_start();
        match trimmed.strip_prefix("server:") {
            Some(url) => {
                let indent = &line[..line.len() - trimmed.len()];
                let newline = if line.ends_with('\n') { "\n" } else { "" };
                out.push_str(indent);
                out.push_str("server: ");
                out.push_str(&replace_host(url.trim(), address));
                out.push_str(newline);
            }
            None => out.push_str(line),
        }
    }
    out
}

fn replace_host(url: &str, address: &str) -> String {
    let (scheme, rest) = match url.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, url),
    };
    let host_end = if rest.starts_with('[') {
        rest.find(']').map_or(rest.len(), |i| i + 1)
    } else {
        rest.find([':', '/']).unwrap_or(rest.len())
    };
    let tail = &rest[host_end..];
    match scheme {
        Some(scheme) => format!("{scheme}://{address}{tail}"),
        None => format!("{address}{tail}"),
    }
}

//! Machine information for GETINFO

use std::env;
use wsrelay_protocol::InfoReply;

fn env_or_empty(keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_default()
}

/// CPU architecture in the controller's naming
pub fn cpu_arch() -> &'static str {
    match env::consts::ARCH {
        "x86_64" => "x64",
        "x86" => "x86",
        "aarch64" => "arm64",
        other => other,
    }
}

pub fn collect() -> InfoReply {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();

    InfoReply {
        pid: std::process::id().to_string(),
        username: env_or_empty(&["USERNAME", "USER", "LOGNAME"]),
        domain: env_or_empty(&["USERDOMAIN"]),
        logon_server: env_or_empty(&["LOGONSERVER"]),
        cpu_arch: cpu_arch().to_string(),
        hostname,
        // No LSA lookup on this side
        user_sid: String::new(),
    }
}

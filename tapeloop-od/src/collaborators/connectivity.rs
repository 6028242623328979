//! Network presence probe
//!
//! The device is considered online only while joined to the configured
//! Wi-Fi network (the user's phone hotspot). Without a configured SSID it
//! is always online.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::ConnectivityProbe;

pub struct SsidProbe {
    target_ssid: Option<String>,
}

impl SsidProbe {
    pub fn new(target_ssid: Option<String>) -> Self {
        Self { target_ssid }
    }

    /// SSID of the active connection, trying nmcli then iwgetid
    async fn current_ssid() -> Option<String> {
        if let Ok(output) = Command::new("nmcli")
            .args(["-t", "-f", "active,ssid", "dev", "wifi"])
            .output()
            .await
        {
            if output.status.success() {
                let stdout = String::from_utf8_lossy(&output.stdout);
                if let Some(ssid) = parse_nmcli(&stdout) {
                    return Some(ssid);
                }
            }
        }

        match Command::new("iwgetid").arg("-r").output().await {
            Ok(output) if output.status.success() => {
                let ssid = String::from_utf8_lossy(&output.stdout).trim().to_string();
                (!ssid.is_empty()).then_some(ssid)
            }
            _ => None,
        }
    }
}

/// Active SSID from `nmcli -t -f active,ssid dev wifi` output
pub fn parse_nmcli(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.strip_prefix("yes:"))
        .map(|ssid| ssid.replace("\\:", ":"))
        .find(|ssid| !ssid.is_empty())
}

#[async_trait]
impl ConnectivityProbe for SsidProbe {
    async fn is_online(&self) -> bool {
        let Some(target) = &self.target_ssid else {
            return true;
        };

        let current = Self::current_ssid().await;
        debug!(target = %target, current = ?current, "Connectivity probe");
        current.as_deref() == Some(target.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_nmcli_active_line() {
        let output = "no:Neighbours\nyes:Phone\\:Hotspot\nno:\n";
        assert_eq!(parse_nmcli(output), Some("Phone:Hotspot".to_string()));
        assert_eq!(parse_nmcli("no:Other\n"), None);
    }

    #[tokio::test]
    async fn test_no_target_is_always_online() {
        assert!(SsidProbe::new(None).is_online().await);
    }
}

//! Device identity stamped on every uploaded payload.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
}

impl DeviceIdentity {
    /// A fresh identity for this machine.
    pub fn generate() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: default_device_name(),
        }
    }
}

/// "<OS> (<hostname>)", or just the OS when the hostname is unavailable.
pub fn default_device_name() -> String {
    let os = os_label(std::env::consts::OS);
    match hostname::get().ok().and_then(|h| h.into_string().ok()) {
        Some(host) if !host.trim().is_empty() => format!("{} ({})", os, host.trim()),
        _ => os,
    }
}

fn os_label(os: &str) -> String {
    match os {
        "linux" => "Linux".to_string(),
        "macos" => "macOS".to_string(),
        "windows" => "Windows".to_string(),
        "ios" => "iOS".to_string(),
        "android" => "Android".to_string(),
        "freebsd" => "FreeBSD".to_string(),
        other => {
            let mut chars = other.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => "Unknown device".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("linux", "Linux")]
    #[test_case("macos", "macOS")]
    #[test_case("haiku", "Haiku")]
    #[test_case("", "Unknown device")]
    fn test_os_label(os: &str, expected: &str) {
        assert_eq!(os_label(os), expected);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = DeviceIdentity::generate();
        let b = DeviceIdentity::generate();
        assert_ne!(a.id, b.id);
        assert!(!a.name.is_empty());
    }
}

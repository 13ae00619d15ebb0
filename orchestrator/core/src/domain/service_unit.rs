// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Boot-time unlock unit for an encrypted mount point.

use serde::{Deserialize, Serialize};

pub const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// systemd service that opens the LUKS mapping before its mount unit runs.
///
/// Rendered fresh on every workflow run and written over any existing copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundServiceUnit {
    pub unit_name: String,
    pub mount_unit: String,
    pub mount_point: String,
    /// fetch | open pipeline, already wrapped for `bash -c`.
    pub exec_start: String,
}

impl BoundServiceUnit {
    pub fn new(mount_point: &str, exec_start: impl Into<String>) -> Self {
        Self {
            unit_name: unlock_unit_name(mount_point),
            mount_unit: mount_unit_name(mount_point),
            mount_point: mount_point.to_string(),
            exec_start: exec_start.into(),
        }
    }

    pub fn path(&self) -> String {
        format!("{}/{}", SYSTEMD_UNIT_DIR, self.unit_name)
    }

    pub fn render(&self) -> String {
        format!(
            "[Unit]\n\
             Description=Unlock the LUKS volume backing {mount_point}\n\
             DefaultDependencies=no\n\
             Wants=network-online.target\n\
             After=network-online.target\n\
             Before={mount_unit}\n\
             \n\
             [Service]\n\
             Type=oneshot\n\
             RemainAfterExit=yes\n\
             ExecStart={exec_start}\n\
             \n\
             [Install]\n\
             WantedBy=remote-fs.target\n\
             RequiredBy={mount_unit}\n",
            mount_point = self.mount_point,
            mount_unit = self.mount_unit,
            exec_start = self.exec_start,
        )
    }
}

/// `/u02` -> `luks-dev-u02.service`, `/u01/app` -> `luks-dev-u01-app.service`
pub fn unlock_unit_name(mount_point: &str) -> String {
    format!(
        "luks-dev{}.service",
        mount_point.trim_end_matches('/').replace('/', "-")
    )
}

/// systemd mount unit for a path, escaped the way `systemd-escape --path`
/// does: separators become `-` and a literal `-` becomes `\x2d`.
pub fn mount_unit_name(mount_point: &str) -> String {
    let trimmed = mount_point.trim_matches('/');
    if trimmed.is_empty() {
        return "-.mount".to_string();
    }
    let escaped: Vec<String> = trimmed
        .split('/')
        .filter(|c| !c.is_empty())
        .map(|component| {
            component
                .chars()
                .enumerate()
                .map(|(i, c)| match c {
                    c if c.is_ascii_alphanumeric() || c == '_' => c.to_string(),
                    '.' if i > 0 => ".".to_string(),
                    c => {
                        let mut buf = [0u8; 4];
                        c.encode_utf8(&mut buf)
                            .bytes()
                            .map(|b| format!("\\x{:02x}", b))
                            .collect()
                    }
                })
                .collect()
        })
        .collect();
    format!("{}.mount", escaped.join("-"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_names() {
        assert_eq!(unlock_unit_name("/u02"), "luks-dev-u02.service");
        assert_eq!(unlock_unit_name("/u01/app/"), "luks-dev-u01-app.service");
        assert_eq!(mount_unit_name("/u02"), "u02.mount");
        assert_eq!(mount_unit_name("/u01/app"), "u01-app.mount");
        assert_eq!(mount_unit_name("/data-1"), "data\\x2d1.mount");
        assert_eq!(mount_unit_name("/"), "-.mount");
    }

    #[test]
    fn test_render_orders_before_mount() {
        let unit = BoundServiceUnit::new("/u02", "/bin/bash -c 'true'");
        let text = unit.render();
        assert_eq!(unit.path(), "/etc/systemd/system/luks-dev-u02.service");
        assert!(text.contains("Before=u02.mount\n"));
        assert!(text.contains("RequiredBy=u02.mount\n"));
        assert!(text.contains("ExecStart=/bin/bash -c 'true'\n"));
    }
}

pub mod enhance;
pub mod link;
pub mod subscription;
pub mod types;

use std::path::Path;

use anyhow::{Context, Result};

pub use types::Settings;

/// 读取设置文件：展开环境变量、解析 YAML、校验
pub fn load_settings(path: impl AsRef<Path>) -> Result<Settings> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read settings {}", path.display()))?;
    parse_settings(&raw).with_context(|| format!("invalid settings {}", path.display()))
}

pub fn parse_settings(content: &str) -> Result<Settings> {
    let expanded = enhance::expand_env_vars(content);
    let settings: Settings = if expanded.trim().is_empty() {
        Settings::default()
    } else {
        serde_yml::from_str(&expanded)?
    };
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let s = parse_settings("").unwrap();
        assert_eq!(s.test.concurrency, 5);
        assert_eq!(s.test.timeout_ms, 3000);
        assert_eq!(s.core.crash_threshold, 3);
        assert_eq!(s.core.crash_window_secs, 60);
        assert_eq!(s.core.max_log_lines, 200);
        assert_eq!(s.inbound.mixed_port, 2080);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let s = parse_settings("core:\n  binary: /opt/sing-box\n  crash_threshold: 5\n").unwrap();
        assert_eq!(s.core.binary, std::path::PathBuf::from("/opt/sing-box"));
        assert_eq!(s.core.crash_threshold, 5);
        assert_eq!(s.core.args, vec!["run", "-c", "{config}"]);
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = parse_settings("test:\n  concurrency: 0\n").unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn bad_listen_address_rejected() {
        assert!(parse_settings("inbound:\n  address: localhost\n").is_err());
    }

    #[test]
    fn mux_and_ntp_sections() {
        let s = parse_settings("mux:\n  default_on: true\n  protocol: smux\nntp:\n  enabled: true\n").unwrap();
        assert!(s.mux.default_on);
        assert_eq!(s.mux.protocol, "smux");
        assert_eq!(s.mux.max_streams, 8);
        assert!(s.ntp.enabled);
        assert_eq!(s.ntp.server_port, 123);

        assert!(parse_settings("mux:\n  protocol: quic\n").is_err());
        let err = parse_settings("ntp:\n  enabled: true\n  server: ''\n").unwrap_err();
        assert!(err.to_string().contains("ntp.server"));
    }

    #[test]
    fn load_settings_expands_env() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("CW_TEST_DATA_DIR", "/var/lib/cw");
        let path = dir.path().join("corewarden.yaml");
        std::fs::write(
            &path,
            "data_dir: ${CW_TEST_DATA_DIR}\ninbound:\n  mixed_port: ${CW_TEST_PORT:-7890}\n",
        )
        .unwrap();
        let s = load_settings(&path).unwrap();
        assert_eq!(s.data_dir, std::path::PathBuf::from("/var/lib/cw"));
        assert_eq!(s.inbound.mixed_port, 7890);
        std::env::remove_var("CW_TEST_DATA_DIR");
    }
}

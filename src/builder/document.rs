use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::model::ProfileId;
use crate::store::persist::write_atomic;

/// 需要与 core 一起启动的外部辅助程序
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalProcessSpec {
    /// 对应 outbound 的 tag
    pub tag: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub socks_port: u16,
}

/// 生成结果，不可变
///
/// 文档只序列化一次；`hash` 是序列化文本的 SHA-256，
/// 内容不变时监控器据此跳过重启。
#[derive(Debug, Clone)]
pub struct CoreConfigDocument {
    value: Value,
    text: String,
    hash: String,
    profile_id: Option<ProfileId>,
    external: Vec<ExternalProcessSpec>,
}

impl CoreConfigDocument {
    pub(crate) fn new(
        value: Value,
        profile_id: Option<ProfileId>,
        external: Vec<ExternalProcessSpec>,
    ) -> Self {
        let text = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        let hash = hex_digest(text.as_bytes());
        Self {
            value,
            text,
            hash,
            profile_id,
            external,
        }
    }

    /// 直接包装一份现成的文档
    pub fn from_value(value: Value) -> Self {
        Self::new(value, None, Vec::new())
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn profile_id(&self) -> Option<ProfileId> {
        self.profile_id
    }

    pub fn external(&self) -> &[ExternalProcessSpec] {
        &self.external
    }

    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        write_atomic(path, self.text.as_bytes())
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

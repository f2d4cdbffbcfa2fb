//! Operator 工具函数
//!
//! 该模块封装了协调过程中常用的辅助函数。

/// 计算字节序列的 SHA-256 哈希（十六进制小写）
pub fn sha256_hash(input: &[u8]) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(input);
    let result = hasher.finalize();

    format!("{:x}", result)
}

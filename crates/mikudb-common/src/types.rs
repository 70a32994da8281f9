//! 公共类型定义模块
//!
//! 定义副本集引擎共享的核心类型:
//! - ObjectId: 12 字节唯一标识符(文档主键)
//! - DatabaseName / CollectionName: 带验证的库名、集合名
//! - Namespace: `database.collection` 形式的命名空间

use crate::error::{MikuError, MikuResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// ObjectId - 12 字节唯一标识符
///
/// 格式:
/// - 前 4 字节: 时间戳(秒,大端)
/// - 中 5 字节: 进程随机数
/// - 后 3 字节: 自增计数器(大端)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId([u8; 12]);

static OID_COUNTER: AtomicU32 = AtomicU32::new(0);

impl ObjectId {
    pub fn new() -> Self {
        let mut bytes = [0u8; 12];
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        bytes[0..4].copy_from_slice(&timestamp.to_be_bytes());
        let random: [u8; 5] = rand_bytes();
        bytes[4..9].copy_from_slice(&random);
        let count = OID_COUNTER.fetch_add(1, Ordering::Relaxed);
        bytes[9..12].copy_from_slice(&count.to_be_bytes()[1..4]);
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> MikuResult<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| MikuError::InvalidObjectId(format!("Invalid hex: {}", e)))?;
        if bytes.len() != 12 {
            return Err(MikuError::InvalidObjectId(
                "ObjectId must be 12 bytes".to_string(),
            ));
        }
        let mut arr = [0u8; 12];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

fn rand_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    #[cfg(target_os = "linux")]
    {
        use std::fs::File;
        use std::io::Read;
        if let Ok(mut f) = File::open("/dev/urandom") {
            let _ = f.read_exact(&mut bytes);
            return bytes;
        }
    }
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    let state = RandomState::new();
    for chunk in bytes.chunks_mut(8) {
        let hash = state.build_hasher().finish().to_le_bytes();
        let len = chunk.len().min(8);
        chunk.copy_from_slice(&hash[..len]);
    }
    bytes
}

/// 数据库名称
///
/// 限制:
/// - 不能为空
/// - 最大 64 字符
/// - 不能包含 `.`、空格或 null 字符
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DatabaseName(String);

impl DatabaseName {
    pub fn new(name: impl Into<String>) -> MikuResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(MikuError::Validation(
                "Database name cannot be empty".to_string(),
            ));
        }
        if name.len() > 64 {
            return Err(MikuError::Validation(
                "Database name cannot exceed 64 characters".to_string(),
            ));
        }
        if name.contains(['.', ' ', '\0']) {
            return Err(MikuError::Validation(format!(
                "Database name contains an illegal character: {:?}",
                name
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 是否为承载协议元数据的管理库
    pub fn is_admin(&self) -> bool {
        self.0 == ADMIN_DB || self.0 == LOCAL_DB
    }
}

impl fmt::Display for DatabaseName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 集合名称
///
/// 禁止空名称和 null 字符。`system.` 前缀只允许出现在管理库中,
/// 由 [`Namespace`] 负责检查。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CollectionName(String);

impl CollectionName {
    pub fn new(name: impl Into<String>) -> MikuResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(MikuError::Validation(
                "Collection name cannot be empty".to_string(),
            ));
        }
        if name.contains('\0') {
            return Err(MikuError::Validation(
                "Collection name cannot contain null character".to_string(),
            ));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 管理库名称
pub const ADMIN_DB: &str = "admin";
/// 本地元数据库名称
pub const LOCAL_DB: &str = "local";

/// 命名空间 `database.collection`
///
/// 以字符串形式序列化,第一个 `.` 之前为库名,之后为集合名。
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: DatabaseName,
    coll: CollectionName,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> MikuResult<Self> {
        let db = DatabaseName::new(db)?;
        let coll = CollectionName::new(coll)?;
        if coll.as_str().starts_with("system.") && !db.is_admin() {
            return Err(MikuError::Validation(
                "Collection name cannot start with 'system.'".to_string(),
            ));
        }
        Ok(Self { db, coll })
    }

    /// 解析 `db.coll` 字符串
    pub fn parse(s: &str) -> MikuResult<Self> {
        match s.split_once('.') {
            Some((db, coll)) => Self::new(db, coll),
            None => Err(MikuError::InvalidNamespace(s.to_string())),
        }
    }

    pub fn db(&self) -> &DatabaseName {
        &self.db
    }

    pub fn coll(&self) -> &CollectionName {
        &self.coll
    }

    pub fn is_admin(&self) -> bool {
        self.db.is_admin()
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl TryFrom<String> for Namespace {
    type Error = MikuError;

    fn try_from(value: String) -> MikuResult<Self> {
        Self::parse(&value)
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

impl std::str::FromStr for Namespace {
    type Err = MikuError;

    fn from_str(s: &str) -> MikuResult<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = ObjectId::new();
        let parsed = ObjectId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
        assert!(ObjectId::from_hex("abcd").is_err());
    }

    #[test]
    fn test_object_ids_are_unique() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("partial.included").unwrap();
        assert_eq!(ns.db().as_str(), "partial");
        assert_eq!(ns.coll().as_str(), "included");
        assert_eq!(ns.to_string(), "partial.included");

        // 只按第一个点切分
        let ns = Namespace::parse("admin.system.replset").unwrap();
        assert_eq!(ns.coll().as_str(), "system.replset");
        assert!(ns.is_admin());
    }

    #[test]
    fn test_namespace_rejects_invalid() {
        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
        assert!(Namespace::parse("user.system.users").is_err());
    }

    #[test]
    fn test_namespace_serde_as_string() {
        let ns = Namespace::parse("included.included").unwrap();
        let json = serde_json::to_string(&ns).unwrap();
        assert_eq!(json, "\"included.included\"");
        let back: Namespace = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ns);
        assert!(serde_json::from_str::<Namespace>("\"bad\"").is_err());
    }
}

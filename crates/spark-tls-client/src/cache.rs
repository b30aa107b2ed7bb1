use std::collections::HashMap;

use parking_lot::Mutex;

use crate::{certificate::CertificateRecord, config::DEFAULT_SESSION_CACHE_CAPACITY};

/// 按主机记录“可恢复会话当初是针对哪张证书校验通过的”。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 会话复用会跳过证书校验；若复用的会话背后证书已被替换，调用方此前的信任判断就失效了；
/// - 该缓存为每个主机保存最近一次完整握手中校验通过的证书，供复用握手完成后比对。
///
/// ## 契约（What）
/// - `remember`：仅在完整握手且证书可信时写入；
/// - `forget`：证书失败或被替换时清除，与引擎侧的会话失效同步进行；
/// - 容量满时淘汰任意一个旧条目，缓存只是优化，丢失条目只会导致下一次走完整握手。
#[derive(Debug)]
pub struct SessionCache {
    entries: Mutex<HashMap<String, CertificateRecord>>,
    capacity: usize,
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CACHE_CAPACITY)
    }
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn remember(&self, host: &str, certificate: CertificateRecord) {
        let mut entries = self.entries.lock();
        if !entries.contains_key(host) && entries.len() >= self.capacity {
            let victim = entries.keys().next().cloned();
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }
        entries.insert(host.to_owned(), certificate);
    }

    pub fn certificate(&self, host: &str) -> Option<CertificateRecord> {
        self.entries.lock().get(host).cloned()
    }

    /// 清除主机条目，返回是否确有条目被移除。
    pub fn forget(&self, host: &str) -> bool {
        self.entries.lock().remove(host).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_and_forget_per_host() {
        let cache = SessionCache::new(4);
        cache.remember("a.test", CertificateRecord::new(&b"a"[..]));
        assert_eq!(
            cache.certificate("a.test").map(|c| c.der().to_vec()),
            Some(b"a".to_vec())
        );
        assert!(cache.certificate("b.test").is_none());
        assert!(cache.forget("a.test"));
        assert!(!cache.forget("a.test"));
        assert!(cache.is_empty());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = SessionCache::new(2);
        cache.remember("a.test", CertificateRecord::new(&b"a"[..]));
        cache.remember("b.test", CertificateRecord::new(&b"b"[..]));
        cache.remember("c.test", CertificateRecord::new(&b"c"[..]));
        assert_eq!(cache.len(), 2);
        assert!(cache.certificate("c.test").is_some());

        cache.remember("c.test", CertificateRecord::new(&b"c2"[..]));
        assert_eq!(cache.len(), 2);
    }
}

//! JSON File Store
//! ID→レコードの永続マッピング。書き込みは一時ファイル + rename で原子的に行う。

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// レコード種別ごとに1ファイル（drafts.json / orders.json / offers.json）。
/// 書き込みは常にマッピング全体で、最後に完了した rename が勝つ。
pub struct JsonStore<T> {
    path: PathBuf,
    cache: RwLock<HashMap<String, T>>,
}

impl<T: Clone + Serialize + DeserializeOwned> JsonStore<T> {
    /// ファイルを読み込んでストアを開く。無い・壊れている場合は空で開始する
    /// （起動を止めない）。
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let map = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(map) => map,
                Err(e) => {
                    warn!("store {}: unreadable, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            cache: RwLock::new(map),
        }
    }

    pub async fn get(&self, id: &str) -> Option<T> {
        self.cache.read().await.get(id).cloned()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.cache.read().await.contains_key(id)
    }

    pub async fn insert(&self, id: &str, record: T) -> Result<()> {
        let mut cache = self.cache.write().await;
        cache.insert(id.to_string(), record);
        self.persist(&cache).await
    }

    pub async fn remove(&self, id: &str) -> Result<Option<T>> {
        let mut cache = self.cache.write().await;
        let old = cache.remove(id);
        self.persist(&cache).await?;
        Ok(old)
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }

    /// 一時ファイルに書いてから rename する。途中でクラッシュしても
    /// 読めないファイルを残さない。サフィックスは乱数なので並行 save と衝突しない。
    async fn persist(&self, map: &HashMap<String, T>) -> Result<()> {
        let json = serde_json::to_vec_pretty(map)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("store.json");
        let suffix: [u8; 4] = rand::thread_rng().gen();
        let tmp = self
            .path
            .with_file_name(format!("{}.{}.tmp", file_name, hex::encode(suffix)));
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

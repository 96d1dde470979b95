//! 数据集目录
//!
//! 一个命名数据集对应一个目录：
//!
//! ```text
//! recordings/<dataset>/
//!     meta.json            # 数据集级元数据（原子重写）
//!     episode_000000.bin
//!     episode_000001.bin
//!     ...
//! ```
//!
//! 数据集只追加：片段序号单调分配、永不复用；提交失败时序号不
//! 前进，内存里的片段保持原样可重试。

use crate::episode::EpisodeRecord;
use crate::{StoreError, timestamp::unix_time_s};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// 数据集级元数据（`meta.json`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetMeta {
    pub name: String,
    pub created_at: u64,
    /// 下一个待分配的片段序号
    pub next_episode_index: u64,
    /// 已提交片段的序号（有序）
    pub episodes: Vec<u64>,
    /// 最近一次提交的设备集合（机器人序列号 / 相机标识）
    pub robots: Vec<String>,
    pub cameras: Vec<String>,
    /// 最近一次提交的采样频率
    pub freq_hz: u32,
}

impl DatasetMeta {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            created_at: unix_time_s(),
            next_episode_index: 0,
            episodes: Vec::new(),
            robots: Vec::new(),
            cameras: Vec::new(),
            freq_hz: 0,
        }
    }
}

/// 数据集写入端
pub struct DatasetWriter {
    dir: PathBuf,
    meta: DatasetMeta,
}

impl DatasetWriter {
    /// 打开（或创建）名为 `name` 的数据集
    pub fn open(root: impl AsRef<Path>, name: &str) -> Result<Self, StoreError> {
        let dir = root.as_ref().join(name);
        std::fs::create_dir_all(&dir)?;

        let meta_path = dir.join("meta.json");
        let meta = match std::fs::read_to_string(&meta_path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dataset = name, "creating new dataset");
                DatasetMeta::new(name)
            }
            Err(e) => return Err(e.into()),
        };

        Ok(Self { dir, meta })
    }

    pub fn meta(&self) -> &DatasetMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// 下一个将被分配的片段序号（只读，不消耗）
    pub fn next_episode_index(&self) -> u64 {
        self.meta.next_episode_index
    }

    fn episode_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("episode_{:06}.bin", index))
    }

    /// 提交一个封存片段：写片段文件 + 原子更新 meta.json
    ///
    /// 返回分配到的片段序号。失败时（磁盘满、权限等）数据集状态
    /// 不变，调用方保留的片段缓冲可整体重试。
    pub fn commit(&mut self, record: &mut EpisodeRecord) -> Result<u64, StoreError> {
        let index = self.meta.next_episode_index;
        record.metadata.episode_index = index;
        record.metadata.dataset = self.meta.name.clone();

        let path = self.episode_path(index);
        record.save(&path)?;

        // meta 更新在片段文件落盘之后；meta 写失败则回收片段文件，
        // 让下次重试看到与本次完全相同的状态
        let mut updated = self.meta.clone();
        updated.next_episode_index = index + 1;
        updated.episodes.push(index);
        updated.robots = record.robots.iter().map(|r| r.serial.clone()).collect();
        updated.cameras = record.cameras.iter().map(|c| c.identifier.clone()).collect();
        updated.freq_hz = record.metadata.freq_hz;

        if let Err(e) = self.write_meta(&updated) {
            warn!(episode = index, error = %e, "meta update failed, rolling back episode file");
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }

        self.meta = updated;
        debug!(episode = index, samples = record.sample_count(), "episode committed");
        Ok(index)
    }

    /// 原子重写 meta.json（write-temp-then-rename）
    fn write_meta(&self, meta: &DatasetMeta) -> Result<(), StoreError> {
        let path = self.dir.join("meta.json");
        let tmp_path = self.dir.join(format!("meta.json.tmp.{}", std::process::id()));

        let payload = serde_json::to_vec_pretty(meta)?;
        let result = (|| -> Result<(), StoreError> {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&payload)?;
            file.sync_all()?;
            std::fs::rename(&tmp_path, &path)?;
            Ok(())
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::EpisodeMetadata;

    fn empty_record(freq: u32) -> EpisodeRecord {
        EpisodeRecord::new(EpisodeMetadata::new("placeholder", freq))
    }

    #[test]
    fn indices_are_monotonic_across_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let mut writer = DatasetWriter::open(dir.path(), "demo").unwrap();
        assert_eq!(writer.commit(&mut empty_record(30)).unwrap(), 0);
        assert_eq!(writer.commit(&mut empty_record(30)).unwrap(), 1);
        drop(writer);

        // 重新打开后序号继续，不回绕
        let mut writer = DatasetWriter::open(dir.path(), "demo").unwrap();
        assert_eq!(writer.commit(&mut empty_record(30)).unwrap(), 2);
        assert_eq!(writer.meta().episodes, vec![0, 1, 2]);
    }

    #[test]
    fn committed_record_carries_assigned_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = DatasetWriter::open(dir.path(), "demo").unwrap();

        let mut record = empty_record(10);
        writer.commit(&mut record).unwrap();
        assert_eq!(record.metadata.episode_index, 0);
        assert_eq!(record.metadata.dataset, "demo");

        let loaded = EpisodeRecord::load(dir.path().join("demo/episode_000000.bin")).unwrap();
        assert_eq!(loaded.metadata.episode_index, 0);
    }

    #[test]
    fn datasets_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let mut a = DatasetWriter::open(dir.path(), "a").unwrap();
        let mut b = DatasetWriter::open(dir.path(), "b").unwrap();

        a.commit(&mut empty_record(30)).unwrap();
        assert_eq!(b.next_episode_index(), 0);
        b.commit(&mut empty_record(30)).unwrap();
        assert_eq!(a.next_episode_index(), 1);
    }
}

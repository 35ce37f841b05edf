use std::fmt;
use std::path::PathBuf;

/// 逻辑索引状态报告（无锁采样，非强一致）
#[derive(Clone, Debug, Default)]
pub struct IndexReport {
    pub root: PathBuf,
    pub open: bool,
    pub partitions: Vec<PartitionStats>,
}

#[derive(Clone, Debug, Default)]
pub struct PartitionStats {
    pub folder: PathBuf,
    /// 已落盘的最新代
    pub committed_generation: Option<u64>,
    /// searcher 可见的代（落后于 committed 表示尚未 refresh）
    pub visible_generation: Option<u64>,
    pub visible_docs: usize,
    pub pending_docs: usize,
    pub live_searchers: usize,
    pub pinned_generations: Vec<u64>,
    /// 已提交 segment 文件大小
    pub segment_bytes: u64,
}

impl IndexReport {
    pub fn total_docs(&self) -> usize {
        self.partitions.iter().map(|p| p.visible_docs).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.partitions.iter().map(|p| p.segment_bytes).sum()
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

fn generation(g: Option<u64>) -> String {
    g.map_or_else(|| "-".to_string(), |g| g.to_string())
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║           partidx Index Report                   ║")?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(f, "║ root: {}", self.root.display())?;
        writeln!(
            f,
            "║ state: {:<8} partitions: {:<6} docs: {:<10}",
            if self.open { "open" } else { "closed" },
            self.partitions.len(),
            self.total_docs()
        )?;
        writeln!(f, "║ on disk: {}", human_bytes(self.total_bytes()))?;
        for p in &self.partitions {
            writeln!(f, "╠──────────────────────────────────────────────────╣")?;
            writeln!(f, "║ {}", p.folder.display())?;
            writeln!(
                f,
                "║   generation:   committed={} visible={}",
                generation(p.committed_generation),
                generation(p.visible_generation)
            )?;
            writeln!(
                f,
                "║   docs:         {:>10}  (pending {})",
                p.visible_docs, p.pending_docs
            )?;
            writeln!(f, "║   searchers:    {:>10}", p.live_searchers)?;
            if !p.pinned_generations.is_empty() {
                writeln!(f, "║   pinned:       {:?}", p.pinned_generations)?;
            }
            writeln!(f, "║   segment:      {:>10}", human_bytes(p.segment_bytes))?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}

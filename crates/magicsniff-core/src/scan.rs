//! 批量识别与并行调度
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{MagicError, Result};
use crate::magic::Magic;
use crate::options::{ScanOptions, ScanStats};
use crate::types::{Identification, OutputItem};

/// 遍历目录识别所有普通文件，并将结果以 JSON 数组流式写入 `out`
///
/// 稳定性保证：文件按路径排序，并行时由写线程按下标重排，输出顺序与串行一致。
/// 识别失败的文件计入 `files_failed` 并跳过。
pub fn scan_and_write(input: &Path, out: &mut dyn Write, magic: &Magic, opts: &ScanOptions) -> Result<ScanStats> {
    let files = collect_files(input, magic.options().follow_symlinks, opts.max_depth);
    debug!(input = %input.display(), files = files.len(), "collected files");

    let threads = opts.threads.unwrap_or_else(num_cpus::get);
    let mut writer = ItemWriter::new(out, input);
    if threads > 1 && files.len() > 1 {
        scan_parallel(files, &mut writer, magic, threads)?;
    } else {
        write!(writer.out, "[")?;
        for path in &files {
            let res = magic.identify_file_full(path);
            writer.write(path, res)?;
        }
        write!(writer.out, "]")?;
    }
    Ok(writer.stats)
}

fn collect_files(input: &Path, follow_links: bool, max_depth: Option<usize>) -> Vec<PathBuf> {
    let mut walker = WalkDir::new(input).min_depth(1).follow_links(follow_links);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }
    let mut files: Vec<PathBuf> = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    files.sort();
    files
}

/// 结果写出：维护逗号分隔与统计
struct ItemWriter<'a> {
    out: &'a mut dyn Write,
    root: &'a Path,
    first: bool,
    stats: ScanStats,
}

impl<'a> ItemWriter<'a> {
    fn new(out: &'a mut dyn Write, root: &'a Path) -> Self {
        Self { out, root, first: true, stats: ScanStats::default() }
    }

    fn write(&mut self, path: &Path, res: Result<Identification>) -> Result<()> {
        let id = match res {
            Ok(id) => id,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "identification failed");
                self.stats.files_failed += 1;
                return Ok(());
            }
        };
        self.stats.files_scanned += 1;
        let rel = path.strip_prefix(self.root).unwrap_or(path);
        let shown = rel.to_string_lossy();
        if !self.first {
            write!(self.out, ",")?;
        }
        self.first = false;
        let item = OutputItem { path: &shown, result: &id };
        serde_json::to_writer(&mut *self.out, &item).map_err(|e| MagicError::Io(e.into()))?;
        self.stats.outputs_written += 1;
        Ok(())
    }
}

/// 并行调度：
/// - 后台线程内使用 Rayon 线程池并行识别
/// - 当前线程作为写线程，按下标重排后流式写出
fn scan_parallel(files: Vec<PathBuf>, writer: &mut ItemWriter<'_>, magic: &Magic, threads: usize) -> Result<()> {
    use crossbeam_channel as channel;
    use rayon::prelude::*;

    type Msg = (usize, Result<Identification>);
    let (tx, rx) = channel::bounded::<Msg>(256);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| MagicError::Config(format!("thread pool: {e}")))?;

    let worker_magic = magic.clone();
    let worker_files = files.clone();
    let scan_thread = std::thread::spawn(move || {
        pool.install(|| {
            // 接收端关闭后发送失败，提前结束剩余任务
            let _ = worker_files.par_iter().enumerate().try_for_each_with(tx, |tx, (idx, path)| {
                tx.send((idx, worker_magic.identify_file_full(path))).map_err(|_| ())
            });
        });
        // Sender 全部丢弃后接收端收到关闭信号
    });

    let written = write_in_order(&files, writer, &rx);
    // 先关闭接收端再回收后台线程，写出失败时工作线程不会阻塞在 send 上
    drop(rx);
    if scan_thread.join().is_err() {
        warn!("scan worker thread panicked");
    }
    written?;
    write!(writer.out, "]")?;
    Ok(())
}

/// 按下标重排后写出，直到所有发送端关闭
fn write_in_order(
    files: &[PathBuf],
    writer: &mut ItemWriter<'_>,
    rx: &crossbeam_channel::Receiver<(usize, Result<Identification>)>,
) -> Result<()> {
    write!(writer.out, "[")?;
    let mut next_idx = 0usize;
    let mut pending: BTreeMap<usize, Result<Identification>> = BTreeMap::new();
    while let Ok((idx, res)) = rx.recv() {
        pending.insert(idx, res);
        while let Some(res) = pending.remove(&next_idx) {
            writer.write(&files[next_idx], res)?;
            next_idx += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::RuleSet;
    use crate::options::Options;
    use std::sync::Arc;

    const RULES: &str = r#"
[[rules]]
offset = "0"
type = "string"
test = "%PDF-"
desc = "PDF document"
mime = "application/pdf"
"#;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.pdf"), b"%PDF-1.7\n").unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello\n").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("c.bin"), b"\x00\x01\x02\x03").unwrap();
        dir
    }

    fn run(dir: &Path, opts: &ScanOptions) -> (serde_json::Value, ScanStats) {
        let magic = Magic::with_rules(Arc::new(RuleSet::from_toml_str(RULES).unwrap()), Options::default());
        let mut out = Vec::new();
        let stats = scan_and_write(dir, &mut out, &magic, opts).unwrap();
        (serde_json::from_slice(&out).unwrap(), stats)
    }

    #[test]
    fn test_scan_serial_sorted_output() {
        let dir = fixture();
        let (json, stats) = run(dir.path(), &ScanOptions { threads: Some(1), max_depth: None });
        let items = json.as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(stats.files_scanned, 3);
        assert_eq!(stats.outputs_written, 3);
        assert_eq!(items[0]["path"], "a.txt");
        assert_eq!(items[0]["mime_type"], "text/plain");
        assert_eq!(items[1]["path"], "b.pdf");
        assert_eq!(items[1]["description"], "PDF document");
        assert_eq!(items[2]["description"], "data");
    }

    #[test]
    fn test_scan_parallel_matches_serial() {
        let dir = fixture();
        let (serial, _) = run(dir.path(), &ScanOptions { threads: Some(1), max_depth: None });
        let (parallel, stats) = run(dir.path(), &ScanOptions { threads: Some(4), max_depth: None });
        assert_eq!(serial, parallel);
        assert_eq!(stats.files_failed, 0);
    }

    /// 写入若干字节后开始报错的输出
    struct FailingWriter {
        budget: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget < buf.len() {
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "output closed"));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_scan_parallel_write_error_is_returned() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..600 {
            std::fs::write(dir.path().join(format!("f{i:03}.pdf")), b"%PDF-1.4\n").unwrap();
        }
        let magic = Magic::with_rules(Arc::new(RuleSet::from_toml_str(RULES).unwrap()), Options::default());
        let mut out = FailingWriter { budget: 64 };
        let opts = ScanOptions { threads: Some(4), max_depth: None };
        let err = scan_and_write(dir.path(), &mut out, &magic, &opts).unwrap_err();
        assert!(matches!(err, MagicError::Io(ref e) if e.kind() == std::io::ErrorKind::BrokenPipe), "{err:?}");
    }

    #[test]
    fn test_scan_max_depth() {
        let dir = fixture();
        let (json, _) = run(dir.path(), &ScanOptions { threads: Some(1), max_depth: Some(1) });
        assert_eq!(json.as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_scan_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let (json, stats) = run(dir.path(), &ScanOptions::default());
        assert_eq!(json, serde_json::json!([]));
        assert_eq!(stats.files_scanned, 0);
    }
}

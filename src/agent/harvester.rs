//! Harvester - 单文件跟踪
//!
//! 从断点开始读文件，按换行切分，每个完整行构造一个事件发往 Spooler。
//! 发送是阻塞的：Spooler 跟不上时 Harvester 停下来等。
//!
//! 读到文件末尾后短暂等待再检查：
//! - 文件变短 → 截断：`tail_on_rotate` 时从头重读，否则退出交给 Prospector
//! - 路径指向了另一个文件 → 轮转：读完旧文件剩余内容后退出
//! - 超过 dead time 没有增长（包括路径已被删除）→ 退出，文件再增长时由 Prospector 重新拉起

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, Instant};

use crate::types::{DataEvent, Fields, FileIdentity};

/// Harvester 参数
#[derive(Debug, Clone)]
pub struct HarvesterOptions {
    /// 读缓冲大小
    pub buffer_size: usize,
    /// 截断后从头继续读
    pub tail_on_rotate: bool,
    /// 多久没有增长后退出
    pub dead_time: Duration,
    /// 到达末尾后的首次等待
    pub poll_min: Duration,
    /// 末尾等待的上限
    pub poll_max: Duration,
    /// 单行最大字节数，超出部分拆成多个事件
    pub max_line_bytes: usize,
}

impl Default for HarvesterOptions {
    fn default() -> Self {
        Self {
            buffer_size: 16 << 10,
            tail_on_rotate: false,
            dead_time: Duration::from_secs(24 * 60 * 60),
            poll_min: Duration::from_millis(100),
            poll_max: Duration::from_secs(1),
            max_line_bytes: 1 << 20,
        }
    }
}

/// 退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HarvestExit {
    /// dead time 内没有增长
    Idle,
    /// 路径已指向新文件，旧文件已读完
    Rotated,
    /// 文件被截断且未开启 tail_on_rotate
    Truncated,
    /// 收到停止信号或下游已关闭
    Shutdown,
    /// 打开/读取失败
    Failed(String),
}

/// 退出报告（发给所属 Prospector）
#[derive(Debug, Clone)]
pub struct HarvestReport {
    pub path: PathBuf,
    pub identity: FileIdentity,
    /// 已读并发出的位置
    pub offset: u64,
    pub line: u64,
    pub exit: HarvestExit,
}

/// 末尾检查的结论
enum EofCheck {
    /// 有新数据或继续等待
    Continue,
    /// 截断，已回到文件开头
    Restarted,
    Exit(HarvestExit),
}

/// 事件出口：下游通道 + 停止信号
struct Outlet {
    events: mpsc::Sender<DataEvent>,
    shutdown: watch::Receiver<bool>,
}

impl Outlet {
    /// 发送事件；下游关闭或收到停止信号时返回 false
    async fn send(&mut self, event: DataEvent) -> bool {
        tokio::select! {
            biased;
            sent = self.events.send(event) => sent.is_ok(),
            _ = stopped(&mut self.shutdown) => false,
        }
    }
}

/// 等待停止信号；发送端已释放时永远挂起
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// 单文件 Harvester
pub struct Harvester {
    path: PathBuf,
    source: Arc<str>,
    identity: FileIdentity,
    fields: Fields,
    options: HarvesterOptions,
    /// 已完整发出的字节位置（不含未结束的半行）
    offset: u64,
    line: u64,
    /// 未遇到换行的半行
    partial: Vec<u8>,
}

impl Harvester {
    /// 创建 Harvester
    ///
    /// `offset`/`line` 为断点位置，新文件传 0。
    pub fn new(
        path: PathBuf,
        identity: FileIdentity,
        offset: u64,
        line: u64,
        fields: Fields,
        options: HarvesterOptions,
    ) -> Self {
        let source: Arc<str> = Arc::from(path.to_string_lossy().as_ref());
        Self {
            path,
            source,
            identity,
            fields,
            options,
            offset,
            line,
            partial: Vec::new(),
        }
    }

    /// 运行直到退出，返回退出报告
    pub async fn harvest(
        mut self,
        events: mpsc::Sender<DataEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> HarvestReport {
        let mut out = Outlet { events, shutdown };
        let exit = self.run(&mut out).await;
        match &exit {
            HarvestExit::Failed(e) => {
                tracing::warn!("Harvester for {} stopped: {}", self.source, e)
            }
            other => tracing::info!(
                "Harvester for {} stopped ({:?}) at offset {}",
                self.source,
                other,
                self.offset
            ),
        }

        HarvestReport {
            path: self.path,
            identity: self.identity,
            offset: self.offset,
            line: self.line,
            exit,
        }
    }

    async fn run(&mut self, out: &mut Outlet) -> HarvestExit {
        let mut file = match self.open().await {
            Ok(f) => f,
            Err(exit) => return exit,
        };

        let mut buf = vec![0u8; self.options.buffer_size.max(1)];
        let mut last_growth = Instant::now();
        let mut poll = self.options.poll_min;

        loop {
            if *out.shutdown.borrow() {
                return HarvestExit::Shutdown;
            }

            let n = match file.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => return HarvestExit::Failed(format!("read failed: {}", e)),
            };

            if n > 0 {
                last_growth = Instant::now();
                poll = self.options.poll_min;
                if !self.consume(&buf[..n], out).await {
                    return HarvestExit::Shutdown;
                }
                continue;
            }

            // 到达末尾
            match self.check_at_eof(&mut file, &mut buf, out).await {
                EofCheck::Continue => {}
                EofCheck::Restarted => {
                    last_growth = Instant::now();
                    continue;
                }
                EofCheck::Exit(exit) => return exit,
            }

            if last_growth.elapsed() >= self.options.dead_time {
                tracing::debug!(
                    "Stopping harvest of {}; last change was {:?} ago",
                    self.source,
                    last_growth.elapsed()
                );
                return HarvestExit::Idle;
            }

            tokio::select! {
                _ = sleep(poll) => {}
                _ = stopped(&mut out.shutdown) => {}
            }
            poll = (poll * 2).min(self.options.poll_max);
        }
    }

    /// 打开文件并定位到断点
    async fn open(&mut self) -> Result<File, HarvestExit> {
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| HarvestExit::Failed(format!("open failed: {}", e)))?;

        // 打开的必须是 Prospector 看到的那个文件
        match FileIdentity::of(&self.path) {
            Ok(id) if id == self.identity => {}
            Ok(_) => return Err(HarvestExit::Rotated),
            Err(e) => return Err(HarvestExit::Failed(format!("stat failed: {}", e))),
        }

        let len = file
            .metadata()
            .await
            .map_err(|e| HarvestExit::Failed(format!("stat failed: {}", e)))?
            .len();
        if len < self.offset {
            tracing::info!(
                "File {} is shorter ({}) than the resume offset ({}), starting from the beginning",
                self.source,
                len,
                self.offset
            );
            self.offset = 0;
            self.line = 0;
        }

        file.seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|e| HarvestExit::Failed(format!("seek failed: {}", e)))?;
        tracing::info!("Started harvester for {} at offset {}", self.source, self.offset);
        Ok(file)
    }

    /// 末尾检查：截断与轮转
    async fn check_at_eof(
        &mut self,
        file: &mut File,
        buf: &mut [u8],
        out: &mut Outlet,
    ) -> EofCheck {
        let read_pos = self.offset + self.partial.len() as u64;
        let len = match file.metadata().await {
            Ok(m) => m.len(),
            Err(e) => return EofCheck::Exit(HarvestExit::Failed(format!("stat failed: {}", e))),
        };

        if len < read_pos {
            if !self.options.tail_on_rotate {
                tracing::info!("File truncated: {} ({} < {})", self.source, len, read_pos);
                return EofCheck::Exit(HarvestExit::Truncated);
            }
            tracing::info!("File truncated, restarting from the beginning: {}", self.source);
            if let Err(e) = file.seek(SeekFrom::Start(0)).await {
                return EofCheck::Exit(HarvestExit::Failed(format!("seek failed: {}", e)));
            }
            self.offset = 0;
            self.line = 0;
            self.partial.clear();
            return EofCheck::Restarted;
        }

        // 路径暂时不存在（删除或改名后尚未重建）时继续读旧句柄，直到 dead time
        let rotated = match FileIdentity::of(&self.path) {
            Ok(id) => id != self.identity,
            Err(e) => {
                tracing::trace!("Cannot stat {}: {}", self.source, e);
                false
            }
        };
        if !rotated {
            return EofCheck::Continue;
        }

        // 读完旧文件已可见的内容再退出
        loop {
            match file.read(buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !self.consume(&buf[..n], out).await {
                        return EofCheck::Exit(HarvestExit::Shutdown);
                    }
                }
                Err(e) => return EofCheck::Exit(HarvestExit::Failed(format!("read failed: {}", e))),
            }
        }
        if !self.partial.is_empty() {
            // 旧文件不会再有换行，剩余半行作为最后一行发出
            let rest = std::mem::take(&mut self.partial);
            if !self.emit(&rest, rest.len() as u64, out).await {
                return EofCheck::Exit(HarvestExit::Shutdown);
            }
        }
        tracing::info!("File rotated: {} (finished at offset {})", self.source, self.offset);
        EofCheck::Exit(HarvestExit::Rotated)
    }

    /// 切分读到的字节，发出完整行
    ///
    /// 下游关闭时返回 false。
    async fn consume(&mut self, data: &[u8], out: &mut Outlet) -> bool {
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (head, tail) = rest.split_at(pos + 1);
            rest = tail;

            let ok = if self.partial.is_empty() {
                self.emit(head, head.len() as u64, out).await
            } else {
                let mut line = std::mem::take(&mut self.partial);
                line.extend_from_slice(head);
                let consumed = line.len() as u64;
                self.emit(&line, consumed, out).await
            };
            if !ok {
                return false;
            }
        }
        self.partial.extend_from_slice(rest);

        // 没有换行的超长行按上限切开发出，半行缓冲不会无限增长
        let max = self.options.max_line_bytes.max(1);
        while self.partial.len() >= max {
            let chunk: Vec<u8> = self.partial.drain(..max).collect();
            tracing::debug!("Splitting line {} of {} at {} bytes", self.line + 1, self.source, max);
            if !self.emit(&chunk, max as u64, out).await {
                return false;
            }
        }
        true
    }

    /// 发出一行（`raw` 含行尾，`consumed` 为其字节数）
    async fn emit(&mut self, raw: &[u8], consumed: u64, out: &mut Outlet) -> bool {
        let mut text = raw;
        if let Some(stripped) = text.strip_suffix(b"\n") {
            text = stripped;
            if let Some(stripped) = text.strip_suffix(b"\r") {
                text = stripped;
            }
        }

        self.offset += consumed;
        self.line += 1;

        let event = DataEvent {
            source: self.source.clone(),
            offset: self.offset,
            line: self.line,
            text: String::from_utf8_lossy(text).into_owned(),
            fields: self.fields.clone(),
            identity: Some(self.identity),
        };
        out.send(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn fast_options() -> HarvesterOptions {
        HarvesterOptions {
            buffer_size: 4,
            poll_min: Duration::from_millis(10),
            poll_max: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn append(path: &std::path::Path, data: &[u8]) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data).unwrap();
    }

    async fn recv(rx: &mut mpsc::Receiver<DataEvent>) -> DataEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_lines_split_across_small_buffer() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"hello world\r\nsecond\npartial");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let harvester = Harvester::new(path.clone(), identity, 0, 0, Default::default(), fast_options());
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));

        let first = recv(&mut rx).await;
        assert_eq!(first.text, "hello world");
        assert_eq!((first.offset, first.line), (13, 1));

        let second = recv(&mut rx).await;
        assert_eq!(second.text, "second");
        assert_eq!((second.offset, second.line), (20, 2));

        // 补全半行
        append(&path, b" line\n");
        let third = recv(&mut rx).await;
        assert_eq!(third.text, "partial line");
        assert_eq!(third.offset, 33);

        handle.abort();
    }

    #[tokio::test]
    async fn test_overlong_line_is_split() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("binary.log");
        append(&path, b"abcdefghijkl");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let options = HarvesterOptions {
            max_line_bytes: 8,
            ..fast_options()
        };
        let harvester = Harvester::new(path.clone(), identity, 0, 0, Default::default(), options);
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));

        let first = recv(&mut rx).await;
        assert_eq!(first.text, "abcdefgh");
        assert_eq!((first.offset, first.line), (8, 1));

        // 剩余部分仍等换行
        append(&path, b"\n");
        let second = recv(&mut rx).await;
        assert_eq!(second.text, "ijkl");
        assert_eq!((second.offset, second.line), (13, 2));

        handle.abort();
    }

    #[tokio::test]
    async fn test_resume_from_offset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"a\nb\nc\n");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let harvester = Harvester::new(path, identity, 4, 2, Default::default(), fast_options());
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));

        let event = recv(&mut rx).await;
        assert_eq!(event.text, "c");
        assert_eq!((event.offset, event.line), (6, 3));
        handle.abort();
    }

    #[tokio::test]
    async fn test_truncation_without_tail_exits() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"line one\nline two\n");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let harvester = Harvester::new(path.clone(), identity, 0, 0, Default::default(), fast_options());
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));

        recv(&mut rx).await;
        recv(&mut rx).await;
        std::fs::OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(report.exit, HarvestExit::Truncated);
        assert_eq!(report.offset, 18);
    }

    #[tokio::test]
    async fn test_truncation_with_tail_restarts() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"old old old\n");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let options = HarvesterOptions {
            tail_on_rotate: true,
            ..fast_options()
        };
        let harvester = Harvester::new(path.clone(), identity, 0, 0, Default::default(), options);
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));

        recv(&mut rx).await;
        std::fs::OpenOptions::new().write(true).open(&path).unwrap().set_len(0).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        append(&path, b"new\n");

        let event = recv(&mut rx).await;
        assert_eq!(event.text, "new");
        assert_eq!((event.offset, event.line), (4, 1));
        handle.abort();
    }

    #[tokio::test]
    async fn test_rotation_drains_old_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"first\n");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let harvester = Harvester::new(path.clone(), identity, 0, 0, Default::default(), fast_options());
        let handle = tokio::spawn(harvester.harvest(tx, stop_rx));
        assert_eq!(recv(&mut rx).await.text, "first");

        // 轮转前写入的尾部（含未结束的半行），随后改名并在原路径创建新文件
        append(&path, b"last words\ntrailing");
        std::fs::rename(&path, tmp.path().join("app.log.1")).unwrap();
        append(&path, b"fresh\n");

        assert_eq!(recv(&mut rx).await.text, "last words");
        let tail = recv(&mut rx).await;
        assert_eq!(tail.text, "trailing");
        assert_eq!(tail.offset, 6 + 11 + 8);

        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(report.exit, HarvestExit::Rotated);
        assert_eq!(report.identity, identity);
    }

    #[tokio::test]
    async fn test_idle_exit_after_dead_time() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("quiet.log");
        append(&path, b"only\n");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let options = HarvesterOptions {
            dead_time: Duration::from_millis(100),
            ..fast_options()
        };
        let handle = tokio::spawn(Harvester::new(path, identity, 0, 0, Default::default(), options).harvest(tx, stop_rx));

        recv(&mut rx).await;
        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(report.exit, HarvestExit::Idle);
        assert_eq!((report.offset, report.line), (5, 1));
    }

    #[tokio::test]
    async fn test_shutdown_signal() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("app.log");
        append(&path, b"");

        let identity = FileIdentity::of(&path).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(
            Harvester::new(path, identity, 0, 0, Default::default(), fast_options()).harvest(tx, stop_rx),
        );

        stop_tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(report.exit, HarvestExit::Shutdown);
    }
}
